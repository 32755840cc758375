//! Snippet source text

use std::fmt;
use std::sync::Arc;

/// Immutable user-authored source text.
///
/// Cloning is cheap; edits produce a new snippet rather than mutating one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snippet(Arc<str>);

impl Snippet {
    pub fn new(code: impl Into<Arc<str>>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only snippets are never evaluated
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First non-blank line, truncated, for log lines and the console pane
    pub fn summary(&self, max_chars: usize) -> String {
        let line = self
            .0
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");
        if line.chars().count() > max_chars {
            let cut: String = line.chars().take(max_chars).collect();
            format!("{}…", cut)
        } else {
            line.to_string()
        }
    }
}

impl From<&str> for Snippet {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for Snippet {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl AsRef<str> for Snippet {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Snippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
