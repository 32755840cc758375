//! nom parser for the snippet language
//!
//! Accepts the call-heavy subset of JavaScript that live coding snippets
//! use: declarations, member calls, `new` expressions, literals and simple
//! arithmetic. Anything that would need a real JavaScript engine (functions,
//! loops, assignment) is rejected with a message naming the construct.

use super::ast::{BinaryOp, Expr, Stmt, UnaryOp};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit0, digit1, multispace1, one_of, satisfy},
    combinator::{map, not, opt, recognize},
    error::{ErrorKind, ParseError},
    multi::{many0, separated_list0},
    sequence::{pair, preceded, terminated, tuple},
    Err, IResult,
};
use std::borrow::Cow;
use std::cell::Cell;

/// Nesting limit used when the caller does not pick one
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Parse failure with the remaining input at the failure point
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError<'a> {
    pub input: &'a str,
    pub message: Cow<'static, str>,
}

impl<'a> SyntaxError<'a> {
    pub fn new(input: &'a str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            input,
            message: message.into(),
        }
    }

    fn unexpected(input: &'a str) -> Self {
        Self::new(input, unexpected_message(input))
    }
}

impl<'a> ParseError<&'a str> for SyntaxError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self::unexpected(input)
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn or(self, other: Self) -> Self {
        // Keep whichever branch got further into the source
        if other.input.len() < self.input.len() {
            other
        } else {
            self
        }
    }
}

type PResult<'a, O> = IResult<&'a str, O, SyntaxError<'a>>;

#[derive(Debug, Clone, Copy)]
struct Nesting {
    depth: usize,
    limit: usize,
    arrows: bool,
}

thread_local! {
    static NESTING: Cell<Nesting> = Cell::new(Nesting {
        depth: 0,
        limit: DEFAULT_MAX_DEPTH,
        arrows: true,
    });
}

/// One level of syntax tree depth, released on drop.
///
/// Every construct that makes the tree deeper (a nested expression, a unary
/// operator, each link of a binary or member chain) holds one of these, so
/// the tree the interpreter walks is never deeper than the limit.
struct Level;

impl Level {
    fn enter(input: &str) -> Result<Self, Err<SyntaxError<'_>>> {
        NESTING.with(|cell| {
            let mut nesting = cell.get();
            if nesting.depth >= nesting.limit {
                return Err(Err::Failure(SyntaxError::new(
                    skip_ws(input),
                    format!("Expression nests deeper than {} levels", nesting.limit),
                )));
            }
            nesting.depth += 1;
            cell.set(nesting);
            Ok(Level)
        })
    }
}

impl Drop for Level {
    fn drop(&mut self) {
        NESTING.with(|cell| {
            let mut nesting = cell.get();
            nesting.depth = nesting.depth.saturating_sub(1);
            cell.set(nesting);
        })
    }
}

/// Installs the limits for one parse and restores the previous ones after
struct ParseScope {
    saved: Nesting,
}

impl ParseScope {
    fn begin(source: &str, limit: usize) -> Self {
        let saved = NESTING.with(|cell| {
            cell.replace(Nesting {
                depth: 0,
                limit,
                arrows: source.contains("=>"),
            })
        });
        Self { saved }
    }
}

impl Drop for ParseScope {
    fn drop(&mut self) {
        NESTING.with(|cell| cell.set(self.saved));
    }
}

const RESERVED: &[&str] = &[
    "const", "let", "var", "new", "true", "false", "null", "undefined", "function", "return",
    "if", "else", "for", "while", "do", "class", "this", "typeof", "async", "await", "import",
    "export", "switch", "try", "throw", "delete", "in", "of",
];

const UNSUPPORTED_STATEMENTS: &[&str] = &[
    "function", "return", "if", "for", "while", "do", "class", "switch", "try", "throw",
    "import", "export", "async", "await",
];

fn unexpected_message(input: &str) -> String {
    let rest = input.trim_start();
    match rest.chars().next() {
        None => "Unexpected end of input".to_string(),
        Some(c) if is_ident_char(c) => {
            let word: String = rest.chars().take_while(|&c| is_ident_char(c)).collect();
            format!("Unexpected token '{}'", word)
        }
        Some(c) => format!("Unexpected token '{}'", c),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Turn a recoverable error into a hard failure with a specific message.
///
/// At end of input the message always reads "Unexpected end of input", which
/// is what an unterminated call like `play(` should report.
fn expect<'a, O, F>(mut parser: F, message: &'static str) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    move |input: &'a str| match parser(input) {
        Err(Err::Error(e)) => {
            let here = skip_ws(input);
            let at = if e.input.len() < here.len() { e.input } else { here };
            if at.trim_start().is_empty() {
                Err(Err::Failure(SyntaxError::new(at, "Unexpected end of input")))
            } else {
                Err(Err::Failure(SyntaxError::new(at, message)))
            }
        }
        other => other,
    }
}

fn skip_ws(input: &str) -> &str {
    match ws(input) {
        Ok((rest, _)) => rest,
        Err(_) => input,
    }
}

fn line_comment(input: &str) -> PResult<'_, &str> {
    recognize(pair(tag("//"), take_while(|c| c != '\n')))(input)
}

fn block_comment(input: &str) -> PResult<'_, &str> {
    let (body, _) = tag::<_, _, SyntaxError>("/*")(input)?;
    match body.find("*/") {
        Some(end) => Ok((&body[end + 2..], &input[..end + 4])),
        None => Err(Err::Failure(SyntaxError::new(
            &input[input.len()..],
            "Unterminated comment",
        ))),
    }
}

/// Whitespace and comments
fn ws(input: &str) -> PResult<'_, ()> {
    let (input, _) = many0(alt((multispace1, line_comment, block_comment)))(input)?;
    Ok((input, ()))
}

fn sym<'a>(s: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(ws, tag(s))
}

/// `=` that is not the start of `==` or `=>`
fn assign_op(input: &str) -> PResult<'_, &str> {
    preceded(ws, terminated(tag("="), not(one_of("=>"))))(input)
}

fn raw_identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    move |input: &'a str| {
        let (rest, word) = preceded(ws, raw_identifier)(input)?;
        if word == kw {
            Ok((rest, word))
        } else {
            Err(Err::Error(SyntaxError::unexpected(input)))
        }
    }
}

/// Non-reserved identifier
fn identifier(input: &str) -> PResult<'_, &str> {
    let (rest, word) = preceded(ws, raw_identifier)(input)?;
    if RESERVED.contains(&word) {
        Err(Err::Error(SyntaxError::unexpected(input)))
    } else {
        Ok((rest, word))
    }
}

/// Property names may be reserved words (`part.start`, `Tone.Transport.stop`)
fn property_name(input: &str) -> PResult<'_, &str> {
    preceded(ws, raw_identifier)(input)
}

fn decimal(input: &str) -> PResult<'_, &str> {
    recognize(tuple((
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)
}

fn number_literal(input: &str) -> PResult<'_, Expr> {
    let (rest, text) = decimal(input)?;
    if rest.chars().next().map_or(false, is_ident_start) {
        return Err(Err::Failure(SyntaxError::new(
            rest,
            "Invalid or unexpected token",
        )));
    }
    match text.parse::<f64>() {
        Ok(n) => Ok((rest, Expr::Number(n))),
        Err(_) => Err(Err::Failure(SyntaxError::new(
            input,
            "Invalid or unexpected token",
        ))),
    }
}

fn string_literal(input: &str) -> PResult<'_, String> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('"' | '\''))) => q,
        _ => return Err(Err::Error(SyntaxError::unexpected(input))),
    };
    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                }),
                None => break,
            },
            '\n' => {
                return Err(Err::Failure(SyntaxError::new(
                    &input[i..],
                    "Invalid or unexpected token",
                )))
            }
            c if c == quote => return Ok((&input[i + c.len_utf8()..], out)),
            c => out.push(c),
        }
    }
    Err(Err::Failure(SyntaxError::new(
        &input[input.len()..],
        "Unterminated string literal",
    )))
}

fn template_literal(input: &str) -> PResult<'_, Expr> {
    let (_, _) = char::<_, SyntaxError>('`')(input)?;
    Err(Err::Failure(SyntaxError::new(
        input,
        "Template literals are not supported in the sandbox",
    )))
}

fn keyword_literal(input: &str) -> PResult<'_, Expr> {
    let (rest, word) = raw_identifier(input)?;
    let expr = match word {
        "true" => Expr::Bool(true),
        "false" => Expr::Bool(false),
        "null" => Expr::Null,
        "undefined" => Expr::Undefined,
        "function" => {
            return Err(Err::Failure(SyntaxError::new(
                input,
                "Function expressions are not supported in the sandbox",
            )))
        }
        "this" => {
            return Err(Err::Failure(SyntaxError::new(
                input,
                "'this' is not available in the sandbox",
            )))
        }
        _ => return Err(Err::Error(SyntaxError::unexpected(input))),
    };
    Ok((rest, expr))
}

fn arrow_error(input: &str) -> Err<SyntaxError<'_>> {
    Err::Failure(SyntaxError::new(
        input,
        "Arrow functions are not supported in the sandbox",
    ))
}

fn identifier_expr(input: &str) -> PResult<'_, Expr> {
    let (rest, name) = identifier(input)?;
    if sym("=>")(rest).is_ok() {
        return Err(arrow_error(input));
    }
    Ok((rest, Expr::Ident(name.to_string())))
}

/// Does the parenthesised group starting after `(` close and lead into `=>`?
fn arrow_ahead(after_open: &str) -> bool {
    if !NESTING.with(|cell| cell.get().arrows) {
        return false;
    }
    let mut depth = 1usize;
    for (i, c) in after_open.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return sym("=>")(&after_open[i + 1..]).is_ok();
                }
            }
            _ => {}
        }
    }
    false
}

fn paren_expr(input: &str) -> PResult<'_, Expr> {
    let (rest, _) = char::<_, SyntaxError>('(')(input)?;
    if arrow_ahead(rest) {
        return Err(arrow_error(input));
    }
    let (rest, expr) = expect(expression, "Expected expression")(rest)?;
    let (rest, _) = expect(sym(")"), "Expected ')'")(rest)?;
    Ok((rest, expr))
}

fn array_literal(input: &str) -> PResult<'_, Expr> {
    let (rest, _) = char::<_, SyntaxError>('[')(input)?;
    let (rest, items) = separated_list0(sym(","), expression)(rest)?;
    let (rest, _) = opt(sym(","))(rest)?;
    let (rest, _) = expect(sym("]"), "Expected ',' or ']' in array literal")(rest)?;
    Ok((rest, Expr::Array(items)))
}

fn object_key(input: &str) -> PResult<'_, String> {
    preceded(
        ws,
        alt((
            map(raw_identifier, str::to_string),
            string_literal,
            map(digit1, str::to_string),
        )),
    )(input)
}

fn object_entry(input: &str) -> PResult<'_, (String, Expr)> {
    let (rest, key) = object_key(input)?;
    let (rest, _) = expect(sym(":"), "Expected ':' after property name")(rest)?;
    let (rest, value) = expect(expression, "Expected expression")(rest)?;
    Ok((rest, (key, value)))
}

fn object_literal(input: &str) -> PResult<'_, Expr> {
    let (rest, _) = char::<_, SyntaxError>('{')(input)?;
    let (rest, entries) = separated_list0(sym(","), object_entry)(rest)?;
    let (rest, _) = opt(sym(","))(rest)?;
    let (rest, _) = expect(sym("}"), "Expected ',' or '}' in object literal")(rest)?;
    Ok((rest, Expr::Object(entries)))
}

/// Arguments after the opening `(`, including the closing `)`
fn arguments_tail(input: &str) -> PResult<'_, Vec<Expr>> {
    let (rest, args) = separated_list0(sym(","), expression)(input)?;
    let (rest, _) = opt(sym(","))(rest)?;
    let (rest, _) = expect(sym(")"), "Expected ',' or ')' in argument list")(rest)?;
    Ok((rest, args))
}

/// `new Callee.Path(args)`; the parentheses are optional as in JavaScript
fn new_expr(input: &str) -> PResult<'_, Expr> {
    let (rest, _) = keyword("new")(input)?;
    let (mut rest, name) = expect(identifier, "Expected constructor after 'new'")(rest)?;
    let mut callee = Expr::Ident(name.to_string());
    let mut levels = Vec::new();
    while let Ok((after_dot, _)) = sym(".")(rest) {
        levels.push(Level::enter(rest)?);
        let (after, property) = expect(property_name, "Expected property name after '.'")(after_dot)?;
        callee = Expr::member(callee, property);
        rest = after;
    }
    let (rest, args) = match sym("(")(rest) {
        Ok((after, _)) => arguments_tail(after)?,
        Err(_) => (rest, Vec::new()),
    };
    Ok((
        rest,
        Expr::New {
            callee: Box::new(callee),
            args,
        },
    ))
}

fn primary(input: &str) -> PResult<'_, Expr> {
    let (input, _) = ws(input)?;
    alt((
        number_literal,
        map(string_literal, Expr::Str),
        template_literal,
        array_literal,
        object_literal,
        paren_expr,
        new_expr,
        keyword_literal,
        identifier_expr,
    ))(input)
}

fn postfix(input: &str) -> PResult<'_, Expr> {
    let (mut input, mut expr) = primary(input)?;
    let mut levels = Vec::new();
    loop {
        if sym(".")(input).is_ok() || sym("(")(input).is_ok() || sym("[")(input).is_ok() {
            levels.push(Level::enter(input)?);
        }
        if let Ok((rest, _)) = sym(".")(input) {
            let (rest, name) = expect(property_name, "Expected property name after '.'")(rest)?;
            expr = Expr::member(expr, name);
            input = rest;
        } else if let Ok((rest, _)) = sym("(")(input) {
            let (rest, args) = arguments_tail(rest)?;
            expr = Expr::Call {
                callee: Box::new(expr),
                args,
            };
            input = rest;
        } else if let Ok((rest, _)) = sym("[")(input) {
            let (rest, index) = expect(expression, "Expected expression")(rest)?;
            let (rest, _) = expect(sym("]"), "Expected ']'")(rest)?;
            expr = Expr::Index {
                object: Box::new(expr),
                index: Box::new(index),
            };
            input = rest;
        } else {
            return Ok((input, expr));
        }
    }
}

fn unary(input: &str) -> PResult<'_, Expr> {
    if let Ok((rest, op)) = preceded(ws, one_of::<_, _, SyntaxError>("-+!"))(input) {
        let _level = Level::enter(input)?;
        let (rest, operand) = expect(unary, "Expected expression")(rest)?;
        let op = match op {
            '-' => UnaryOp::Neg,
            '+' => UnaryOp::Plus,
            _ => UnaryOp::Not,
        };
        return Ok((
            rest,
            Expr::Unary {
                op,
                operand: Box::new(operand),
            },
        ));
    }
    postfix(input)
}

fn multiplicative(input: &str) -> PResult<'_, Expr> {
    let (mut input, mut lhs) = unary(input)?;
    let mut levels = Vec::new();
    loop {
        match preceded(ws, one_of::<_, _, SyntaxError>("*/"))(input) {
            Ok((rest, op)) => {
                levels.push(Level::enter(input)?);
                let (rest, rhs) = expect(unary, "Expected expression")(rest)?;
                let op = if op == '*' { BinaryOp::Mul } else { BinaryOp::Div };
                lhs = Expr::binary(op, lhs, rhs);
                input = rest;
            }
            Err(_) => return Ok((input, lhs)),
        }
    }
}

fn additive(input: &str) -> PResult<'_, Expr> {
    let (mut input, mut lhs) = multiplicative(input)?;
    let mut levels = Vec::new();
    loop {
        match preceded(ws, one_of::<_, _, SyntaxError>("+-"))(input) {
            Ok((rest, op)) => {
                levels.push(Level::enter(input)?);
                let (rest, rhs) = expect(multiplicative, "Expected expression")(rest)?;
                let op = if op == '+' { BinaryOp::Add } else { BinaryOp::Sub };
                lhs = Expr::binary(op, lhs, rhs);
                input = rest;
            }
            Err(_) => return Ok((input, lhs)),
        }
    }
}

pub fn expression(input: &str) -> PResult<'_, Expr> {
    let _level = Level::enter(input)?;
    additive(input)
}

fn declaration(input: &str) -> PResult<'_, Stmt> {
    let at = skip_ws(input);
    let (rest, _) = alt((keyword("const"), keyword("let"), keyword("var")))(input)?;
    let (rest, name) = expect(identifier, "Expected variable name")(rest)?;
    let (rest, _) = expect(assign_op, "Missing initializer in declaration")(rest)?;
    let (rest, init) = expect(expression, "Expected expression")(rest)?;
    Ok((
        rest,
        Stmt::Declare {
            name: name.to_string(),
            init,
            rest_len: at.len(),
        },
    ))
}

fn unsupported_statement(input: &str) -> PResult<'_, Stmt> {
    let (_, word) = preceded(ws, raw_identifier)(input)?;
    if UNSUPPORTED_STATEMENTS.contains(&word) {
        Err(Err::Failure(SyntaxError::new(
            skip_ws(input),
            format!("'{}' is not supported in the sandbox", word),
        )))
    } else {
        Err(Err::Error(SyntaxError::unexpected(input)))
    }
}

fn expression_statement(input: &str) -> PResult<'_, Stmt> {
    let (rest, expr) = expression(input)?;
    if assign_op(rest).is_ok() {
        return Err(Err::Failure(SyntaxError::new(
            skip_ws(rest),
            "Assignment is not supported in the sandbox; declare a new const instead",
        )));
    }
    Ok((rest, Stmt::Expr(expr)))
}

fn statement(input: &str) -> PResult<'_, Stmt> {
    alt((declaration, unsupported_statement, expression_statement))(input)
}

/// Whitespace, comments and `;` between statements
fn separators(input: &str) -> PResult<'_, &str> {
    recognize(many0(alt((
        multispace1,
        line_comment,
        block_comment,
        tag(";"),
    ))))(input)
}

/// Parse a whole snippet under the default nesting limit
pub fn parse_program(source: &str) -> Result<Vec<Stmt>, SyntaxError<'_>> {
    parse_bounded(source, DEFAULT_MAX_DEPTH)
}

/// Parse a whole snippet whose syntax tree may be at most `max_depth` deep
pub fn parse_bounded(source: &str, max_depth: usize) -> Result<Vec<Stmt>, SyntaxError<'_>> {
    let _scope = ParseScope::begin(source, max_depth);
    let mut statements = Vec::new();
    let (mut input, _) = separators(source).map_err(flatten)?;

    while !input.is_empty() {
        let (rest, stmt) = statement(input).map_err(|e| match e {
            Err::Error(e) => SyntaxError::unexpected(e.input),
            other => flatten(other),
        })?;
        statements.push(stmt);

        let (next, skipped) = separators(rest).map_err(flatten)?;
        if !next.is_empty() && !skipped.contains(';') && !skipped.contains('\n') {
            return Err(SyntaxError::unexpected(next));
        }
        input = next;
    }

    Ok(statements)
}

fn flatten(e: Err<SyntaxError<'_>>) -> SyntaxError<'_> {
    match e {
        Err::Error(e) | Err::Failure(e) => e,
        Err::Incomplete(_) => SyntaxError::new("", "Unexpected end of input"),
    }
}

/// 1-based line and column of `rest` within `source`
pub fn line_col(source: &str, rest_len: usize) -> (usize, usize) {
    let offset = source.len().saturating_sub(rest_len);
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(nl) => before[nl + 1..].chars().count() + 1,
        None => before.chars().count() + 1,
    };
    (line, column)
}
