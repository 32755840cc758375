//! Error types surfaced by evaluation and configuration

use std::fmt;
use std::path::PathBuf;

/// Failure of a single evaluation attempt.
///
/// Every variant renders to the one-line message shown in the error banner.
/// None of them is fatal: the controller returns to idle and waits for the
/// user to evaluate again.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The snippet is not valid code
    Compile {
        message: String,
        line: usize,
        column: usize,
    },
    /// The snippet failed while running
    Runtime(String),
    /// The audio library or pattern engine could not be started
    Initialization(String),
}

impl EvaluationError {
    pub fn compile(message: impl Into<String>, line: usize, column: usize) -> Self {
        EvaluationError::Compile {
            message: message.into(),
            line,
            column,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        EvaluationError::Runtime(message.into())
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        EvaluationError::Initialization(message.into())
    }

    /// Short label for the error class, used in logs and the console pane
    pub fn kind(&self) -> &'static str {
        match self {
            EvaluationError::Compile { .. } => "compile",
            EvaluationError::Runtime(_) => "runtime",
            EvaluationError::Initialization(_) => "initialization",
        }
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationError::Compile {
                message,
                line,
                column,
            } => write!(f, "SyntaxError: {} (line {}, column {})", message, line, column),
            EvaluationError::Runtime(msg) => write!(f, "{}", msg),
            EvaluationError::Initialization(msg) => {
                write!(f, "Failed to start playback: {}", msg)
            }
        }
    }
}

impl std::error::Error for EvaluationError {}

/// Result type for evaluation
pub type EvalResult<T> = Result<T, EvaluationError>;

/// Errors raised while loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// Config file is not valid TOML for the expected schema
    Parse { path: PathBuf, message: String },
    /// A value parsed but is out of range
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "Invalid config {}: {}", path.display(), message)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid config value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_message_includes_position() {
        let err = EvaluationError::compile("Unexpected end of input", 1, 11);
        assert_eq!(
            err.to_string(),
            "SyntaxError: Unexpected end of input (line 1, column 11)"
        );
        assert_eq!(err.kind(), "compile");
    }

    #[test]
    fn test_runtime_error_is_passed_through() {
        let err = EvaluationError::runtime("foo is not defined");
        assert_eq!(err.to_string(), "foo is not defined");
    }

    #[test]
    fn test_initialization_error_is_prefixed() {
        let err = EvaluationError::initialization("address in use");
        assert_eq!(err.to_string(), "Failed to start playback: address in use");
        assert_eq!(err.kind(), "initialization");
    }

    #[test]
    fn test_initialization_prefix_does_not_name_a_backend() {
        let err = EvaluationError::initialization(
            "pattern server at 127.0.0.1:7770 did not answer within 2000ms",
        );
        let text = err.to_string();
        assert!(text.starts_with("Failed to start playback: pattern server"));
        assert!(!text.contains("audio"));
    }
}
