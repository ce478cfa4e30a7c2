//! Interpreter snapshot options

use creg_core::SessionOptions;

/// Limits for one interpreter save or load
#[derive(Debug, Clone)]
pub struct ScriptOptions {
    /// Capacity of the session string table
    pub max_strings: usize,

    /// Bytes of string and stack payload a load may materialise
    pub max_heap_bytes: usize,

    /// Limits of the underlying graph session
    pub session: SessionOptions,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            max_strings: 1 << 20,
            max_heap_bytes: 1 << 30,
            session: SessionOptions::default(),
        }
    }
}
