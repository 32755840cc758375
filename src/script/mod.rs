//! Sandboxed snippet evaluation
//!
//! Snippets are compiled into a [`Program`] and run by a small interpreter.
//! The only free identifier a program can reach is the namespace binding it
//! was compiled against (for example `Tone`); everything else must be
//! declared in the snippet itself. Host objects are opaque [`HostRef`]s and
//! every interaction with them goes through the [`Namespace`] trait, so the
//! snippet can only do what the namespace chooses to expose.

pub mod ast;
mod interpreter;
pub mod parser;
pub mod value;

pub use value::{HostRef, Value};

use crate::config::SandboxConfig;
use crate::error::{EvalResult, EvaluationError};
use ast::Stmt;
use interpreter::Interpreter;
use std::collections::HashSet;
use tracing::debug;

/// The object injected under the binding name.
///
/// Errors are plain messages; the interpreter reports them as runtime errors
/// verbatim.
pub trait Namespace: Send + Sync {
    /// Handle bound to the namespace identifier itself
    fn root(&self) -> HostRef;

    /// Property read (`Tone.Transport`, `synth.volume`)
    fn get(&self, target: &HostRef, property: &str) -> Result<Value, String>;

    /// Method call (`Tone.now()`, `synth.triggerAttackRelease(...)`)
    fn call(&self, target: &HostRef, method: &str, args: &[Value]) -> Result<Value, String>;

    /// Constructor call (`new Tone.Synth(...)`)
    fn construct(&self, target: &HostRef, class: &str, args: &[Value]) -> Result<Value, String>;
}

/// Compiles snippets under fixed sandbox limits
#[derive(Debug, Clone)]
pub struct Evaluator {
    max_source_bytes: usize,
    max_steps: usize,
    max_depth: usize,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(&SandboxConfig::default())
    }
}

impl Evaluator {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            max_source_bytes: config.max_source_bytes,
            max_steps: config.max_steps,
            max_depth: config.max_depth,
        }
    }

    /// Compile `source` into a program whose only free variable is `binding`
    pub fn compile(&self, binding: &str, source: &str) -> EvalResult<Program> {
        if source.len() > self.max_source_bytes {
            return Err(EvaluationError::compile(
                format!(
                    "Snippet is {} bytes; the sandbox accepts at most {}",
                    source.len(),
                    self.max_source_bytes
                ),
                1,
                1,
            ));
        }

        let statements = parser::parse_bounded(source, self.max_depth).map_err(|e| {
            let (line, column) = parser::line_col(source, e.input.len());
            EvaluationError::compile(e.message, line, column)
        })?;

        check_declarations(binding, source, &statements)?;

        debug!(
            "Compiled snippet: {} statements, {} bytes",
            statements.len(),
            source.len()
        );

        Ok(Program {
            binding: binding.to_string(),
            statements,
            max_steps: self.max_steps,
        })
    }
}

/// Reject redeclarations and shadowing of the namespace binding
fn check_declarations(binding: &str, source: &str, statements: &[Stmt]) -> EvalResult<()> {
    let mut declared = HashSet::new();
    for stmt in statements {
        if let Stmt::Declare { name, rest_len, .. } = stmt {
            let message = if name == binding {
                Some(format!("'{}' is the library namespace and cannot be redeclared", name))
            } else if !declared.insert(name.as_str()) {
                Some(format!("Identifier '{}' has already been declared", name))
            } else {
                None
            };
            if let Some(message) = message {
                let (line, column) = parser::line_col(source, *rest_len);
                return Err(EvaluationError::compile(message, line, column));
            }
        }
    }
    Ok(())
}

/// A compiled snippet, ready to run against a namespace
#[derive(Debug, Clone)]
pub struct Program {
    binding: String,
    statements: Vec<Stmt>,
    max_steps: usize,
}

impl Program {
    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Run the program with `namespace` bound to the binding name
    pub fn invoke(&self, namespace: &dyn Namespace) -> EvalResult<()> {
        Interpreter::new(namespace, &self.binding, self.max_steps).run(&self.statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Namespace that records every call and hands out numbered objects
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        next_id: Mutex<u64>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    impl Namespace for Recorder {
        fn root(&self) -> HostRef {
            HostRef::new("Lib", 0)
        }

        fn get(&self, target: &HostRef, property: &str) -> Result<Value, String> {
            match property {
                "Transport" => Ok(Value::Host(HostRef::new("Transport", 1))),
                "volume" => Ok(Value::Number(-6.0)),
                _ => Err(format!("{}.{} is not available", target.class, property)),
            }
        }

        fn call(&self, target: &HostRef, method: &str, args: &[Value]) -> Result<Value, String> {
            let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            self.calls.lock().unwrap().push(format!(
                "{}#{}.{}({})",
                target.class,
                target.id,
                method,
                rendered.join(", ")
            ));
            match method {
                "now" => Ok(Value::Number(1.5)),
                "fail" => Err("device unplugged".to_string()),
                _ => Ok(Value::Host(target.clone())),
            }
        }

        fn construct(&self, _target: &HostRef, class: &str, _args: &[Value]) -> Result<Value, String> {
            let mut id = self.next_id.lock().unwrap();
            *id += 10;
            Ok(Value::Host(HostRef::new(class, *id)))
        }
    }

    fn run(source: &str) -> (EvalResult<()>, Vec<String>) {
        let ns = Recorder::default();
        let result = Evaluator::default()
            .compile("Lib", source)
            .and_then(|p| p.invoke(&ns));
        (result, ns.calls())
    }

    #[test]
    fn test_calls_reach_namespace_in_order() {
        let (result, calls) = run(
            "const s = new Lib.Synth().toDestination();\nconst now = Lib.now();\ns.play('C4', now + 0.5)",
        );
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(
            calls,
            vec![
                "Synth#10.toDestination()",
                "Lib#0.now()",
                "Synth#10.play(C4, 2)",
            ]
        );
    }

    #[test]
    fn test_nested_member_access() {
        let (result, calls) = run("Lib.Transport.start()");
        assert!(result.is_ok());
        assert_eq!(calls, vec!["Transport#1.start()"]);
    }

    #[test]
    fn test_undefined_identifier_is_runtime_error() {
        let (result, calls) = run("window.alert('hi')");
        assert_eq!(
            result,
            Err(EvaluationError::runtime("window is not defined"))
        );
        assert!(calls.is_empty());
    }

    #[test]
    fn test_namespace_errors_are_runtime_errors() {
        let (result, _) = run("Lib.fail()");
        assert_eq!(result, Err(EvaluationError::runtime("device unplugged")));
    }

    #[test]
    fn test_calling_non_function() {
        let (result, _) = run("const x = 3\nx.play()");
        assert_eq!(result, Err(EvaluationError::runtime("x.play is not a function")));
    }

    #[test]
    fn test_reading_from_undefined() {
        let (result, _) = run("const o = { a: 1 }\no.b.c");
        match result {
            Err(EvaluationError::Runtime(msg)) => {
                assert!(msg.starts_with("Cannot read properties of undefined (reading 'c')"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_redeclaration_is_compile_error() {
        let err = Evaluator::default()
            .compile("Lib", "const a = 1\nconst a = 2")
            .unwrap_err();
        assert_eq!(
            err,
            EvaluationError::compile("Identifier 'a' has already been declared", 2, 1)
        );
    }

    #[test]
    fn test_binding_cannot_be_shadowed() {
        let err = Evaluator::default().compile("Lib", "let Lib = 4").unwrap_err();
        assert!(matches!(err, EvaluationError::Compile { line: 1, column: 1, .. }));
    }

    #[test]
    fn test_syntax_error_position() {
        let err = Evaluator::default().compile("Lib", "badSyntax(").unwrap_err();
        assert_eq!(
            err,
            EvaluationError::compile("Unexpected end of input", 1, 11)
        );
    }

    #[test]
    fn test_source_size_limit() {
        let evaluator = Evaluator::new(&SandboxConfig {
            max_source_bytes: 8,
            max_steps: 100,
            ..SandboxConfig::default()
        });
        let err = evaluator.compile("Lib", "Lib.now(); Lib.now()").unwrap_err();
        assert!(matches!(err, EvaluationError::Compile { .. }));
    }

    #[test]
    fn test_step_budget() {
        let evaluator = Evaluator::new(&SandboxConfig {
            max_source_bytes: 1024,
            max_steps: 5,
            ..SandboxConfig::default()
        });
        let program = evaluator
            .compile("Lib", "[1, 2, 3, 4, 5, 6, 7]")
            .unwrap();
        let err = program.invoke(&Recorder::default()).unwrap_err();
        assert_eq!(
            err,
            EvaluationError::runtime("Execution step budget of 5 exceeded")
        );
    }

    #[test]
    fn test_string_concatenation_and_length() {
        let ns = Recorder::default();
        let program = Evaluator::default()
            .compile("Lib", "const n = 'C' + 4\nLib.play(n, n.length, [1, 2][1])")
            .unwrap();
        program.invoke(&ns).unwrap();
        assert_eq!(ns.calls(), vec!["Lib#0.play(C4, 2, 2)"]);
    }

    #[test]
    fn test_deep_nesting_is_a_compile_error() {
        let evaluator = Evaluator::default();
        for source in [
            "[".repeat(30_000),
            "(".repeat(30_000),
            format!("Lib.play({})", "-".repeat(30_000)),
            "1 + ".repeat(20_000) + "1",
            "Lib".to_string() + &".now()".repeat(10_000),
        ] {
            match evaluator.compile("Lib", &source) {
                Err(EvaluationError::Compile { message, .. }) => {
                    assert!(message.contains("nests deeper than 64"), "{}", message)
                }
                other => panic!("expected compile error, got {:?}", other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_nesting_within_limit_runs() {
        let evaluator = Evaluator::new(&SandboxConfig {
            max_depth: 16,
            ..SandboxConfig::default()
        });
        let ns = Recorder::default();
        let program = evaluator
            .compile("Lib", "Lib.play([[[[1]]]][0][0][0][0], 1 + 2 + 3)")
            .unwrap();
        program.invoke(&ns).unwrap();
        assert_eq!(ns.calls(), vec!["Lib#0.play(1, 6)"]);

        let deep = format!("Lib.play({}1{})", "[".repeat(20), "]".repeat(20));
        assert!(evaluator.compile("Lib", &deep).is_err());
    }
}
