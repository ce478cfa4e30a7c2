//! Interpreter errors

use creg_core::{CregError, ErrorCategory};

/// Interpreter and state-serialization errors
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Save or load failure from the graph serializer
    #[error(transparent)]
    Serialize(#[from] CregError),

    /// Key that cannot index a table
    #[error("invalid table key: {0}")]
    InvalidKey(&'static str),

    /// Handle to an object that is not in the heap
    #[error("stale reference to {0}")]
    StaleReference(&'static str),

    /// Native function name already bound to another function
    #[error("native function name `{0}` is bound to a different function")]
    NativeNameConflict(String),

    /// Package whose root is not an interpreter state
    #[error("package root is {0}, expected GlobalState")]
    UnexpectedRoot(String),

    /// Value that cannot be called from the host
    #[error("not callable: {0}")]
    NotCallable(String),
}

impl ScriptError {
    /// Category of a serializer failure; interpreter misuse has none
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ScriptError::Serialize(err) => Some(err.category()),
            _ => None,
        }
    }
}

/// Interpreter result
pub type ScriptResult<T> = Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializer_errors_keep_category() {
        let err: ScriptError = CregError::UnsupportedValue("handle".into()).into();
        assert_eq!(err.category(), Some(ErrorCategory::Unsupported));
        assert_eq!(err.to_string(), CregError::UnsupportedValue("handle".into()).to_string());
        assert_eq!(ScriptError::InvalidKey("nil").category(), None);
    }
}
