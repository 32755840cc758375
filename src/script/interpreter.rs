//! Tree-walking interpreter with a step budget

use super::ast::{BinaryOp, Expr, Stmt, UnaryOp};
use super::value::Value;
use super::Namespace;
use crate::error::{EvalResult, EvaluationError};
use std::collections::HashMap;

pub(crate) struct Interpreter<'n> {
    namespace: &'n dyn Namespace,
    binding: &'n str,
    locals: HashMap<String, Value>,
    steps: usize,
    max_steps: usize,
}

impl<'n> Interpreter<'n> {
    pub(crate) fn new(namespace: &'n dyn Namespace, binding: &'n str, max_steps: usize) -> Self {
        Self {
            namespace,
            binding,
            locals: HashMap::new(),
            steps: 0,
            max_steps,
        }
    }

    pub(crate) fn run(&mut self, statements: &[Stmt]) -> EvalResult<()> {
        for stmt in statements {
            match stmt {
                Stmt::Declare { name, init, .. } => {
                    let value = self.eval(init)?;
                    self.locals.insert(name.clone(), value);
                }
                Stmt::Expr(expr) => {
                    self.eval(expr)?;
                }
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> EvalResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(EvaluationError::runtime(format!(
                "Execution step budget of {} exceeded",
                self.max_steps
            )));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        self.tick()?;
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Array(items) => {
                let values = self.eval_list(items)?;
                Ok(Value::Array(values))
            }
            Expr::Object(entries) => {
                let mut fields = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    fields.retain(|(k, _): &(String, Value)| k != key);
                    fields.push((key.clone(), value));
                }
                Ok(Value::Object(fields))
            }
            Expr::Ident(name) => self.lookup(name),
            Expr::Member { object, property } => {
                let target = self.eval(object)?;
                self.get_property(&target, object, property)
            }
            Expr::Index { object, index } => {
                let target = self.eval(object)?;
                let index = self.eval(index)?;
                Ok(index_value(&target, &index))
            }
            Expr::Call { callee, args } => self.eval_call(callee, args),
            Expr::New { callee, args } => self.eval_new(callee, args),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                })
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                Ok(binary(*op, &lhs, &rhs))
            }
        }
    }

    fn eval_list(&mut self, exprs: &[Expr]) -> EvalResult<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn lookup(&self, name: &str) -> EvalResult<Value> {
        if name == self.binding {
            return Ok(Value::Host(self.namespace.root()));
        }
        self.locals
            .get(name)
            .cloned()
            .ok_or_else(|| EvaluationError::runtime(format!("{} is not defined", name)))
    }

    fn get_property(&self, target: &Value, object: &Expr, property: &str) -> EvalResult<Value> {
        match target {
            Value::Host(host) => self
                .namespace
                .get(host, property)
                .map_err(EvaluationError::Runtime),
            Value::Undefined | Value::Null => Err(EvaluationError::runtime(format!(
                "Cannot read properties of {} (reading '{}') in {}",
                target.type_name(),
                property,
                object.describe()
            ))),
            Value::Str(s) if property == "length" => Ok(Value::Number(s.chars().count() as f64)),
            Value::Array(items) if property == "length" => Ok(Value::Number(items.len() as f64)),
            Value::Object(_) => Ok(target.field(property).cloned().unwrap_or(Value::Undefined)),
            _ => Ok(Value::Undefined),
        }
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> EvalResult<Value> {
        match callee {
            Expr::Member { object, property } => {
                let target = self.eval(object)?;
                let args = self.eval_list(args)?;
                match &target {
                    Value::Host(host) => self
                        .namespace
                        .call(host, property, &args)
                        .map_err(EvaluationError::Runtime),
                    Value::Undefined | Value::Null => Err(EvaluationError::runtime(format!(
                        "Cannot read properties of {} (reading '{}') in {}",
                        target.type_name(),
                        property,
                        object.describe()
                    ))),
                    _ => Err(EvaluationError::runtime(format!(
                        "{} is not a function",
                        callee.describe()
                    ))),
                }
            }
            _ => {
                // Evaluate first so undefined names report as such
                self.eval(callee)?;
                Err(EvaluationError::runtime(format!(
                    "{} is not a function",
                    callee.describe()
                )))
            }
        }
    }

    fn eval_new(&mut self, callee: &Expr, args: &[Expr]) -> EvalResult<Value> {
        match callee {
            Expr::Member { object, property } => {
                let target = self.eval(object)?;
                let args = self.eval_list(args)?;
                match &target {
                    Value::Host(host) => self
                        .namespace
                        .construct(host, property, &args)
                        .map_err(EvaluationError::Runtime),
                    _ => Err(EvaluationError::runtime(format!(
                        "{} is not a constructor",
                        callee.describe()
                    ))),
                }
            }
            _ => {
                self.eval(callee)?;
                Err(EvaluationError::runtime(format!(
                    "{} is not a constructor",
                    callee.describe()
                )))
            }
        }
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
            items.get(*n as usize).cloned().unwrap_or(Value::Undefined)
        }
        (Value::Str(s), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => s
            .chars()
            .nth(*n as usize)
            .map(|c| Value::Str(c.to_string()))
            .unwrap_or(Value::Undefined),
        (Value::Object(_), Value::Str(key)) => target.field(key).cloned().unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    if op == BinaryOp::Add {
        let stringy = |v: &Value| {
            matches!(
                v,
                Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Host(_)
            )
        };
        if stringy(lhs) || stringy(rhs) {
            return Value::Str(format!("{}{}", lhs, rhs));
        }
    }
    let (a, b) = (lhs.to_number(), rhs.to_number());
    Value::Number(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
    })
}
