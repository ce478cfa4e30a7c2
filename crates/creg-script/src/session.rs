//! Per-call session state
//!
//! A [`ScriptSession`] is created for one save or load, handed to the graph
//! serializer as its context and dropped when the call returns. It owns the
//! session string table, the native-function registry handle and the scoped
//! allocator charged for payload materialised on load.

use std::sync::Arc;

use creg_core::{CregError, CregResult, Serializer};
use rustc_hash::FxHashMap;

use crate::natives::NativeRegistry;
use crate::options::ScriptOptions;
use crate::value::LuaStr;

/// Session string table: byte content to index
#[derive(Debug)]
pub struct StringTable {
    entries: Vec<LuaStr>,
    index: FxHashMap<LuaStr, u32>,
    capacity: usize,
    payloads: usize,
    references: usize,
}

impl StringTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
            capacity,
            payloads: 0,
            references: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strings in index order
    pub fn entries(&self) -> &[LuaStr] {
        &self.entries
    }

    /// Index payloads written or read
    pub fn payloads(&self) -> usize {
        self.payloads
    }

    /// Index references written or read, payload-carrying ones included
    pub fn references(&self) -> usize {
        self.references
    }

    fn reserve_slot(&self) -> CregResult<u32> {
        if self.entries.len() >= self.capacity {
            return Err(CregError::CapacityExceeded {
                what: "session strings",
                limit: self.capacity,
            });
        }
        Ok(self.entries.len() as u32)
    }

    /// Index for a string about to be written; true if the payload must
    /// follow
    pub fn index_for_write(&mut self, string: &LuaStr) -> CregResult<(u32, bool)> {
        self.references += 1;
        if let Some(&index) = self.index.get(string) {
            return Ok((index, false));
        }
        let index = self.reserve_slot()?;
        self.entries.push(string.clone());
        self.index.insert(string.clone(), index);
        self.payloads += 1;
        Ok((index, true))
    }

    /// Append a payload read from a package
    pub fn push_loaded(&mut self, bytes: &[u8]) -> CregResult<LuaStr> {
        let index = self.reserve_slot()?;
        let string = LuaStr::new(bytes);
        if self.index.insert(string.clone(), index).is_some() {
            return Err(CregError::Corrupt(format!(
                "string {string:?} carried twice in one package"
            )));
        }
        self.entries.push(string.clone());
        self.payloads += 1;
        self.references += 1;
        Ok(string)
    }

    /// Entry read back by index
    pub fn get_loaded(&mut self, index: usize) -> CregResult<LuaStr> {
        let string = self
            .entries
            .get(index)
            .cloned()
            .ok_or_else(|| CregError::Corrupt(format!("string index {index} not yet defined")))?;
        self.references += 1;
        Ok(string)
    }
}

/// Byte budget for one session
#[derive(Debug)]
pub struct SessionAllocator {
    budget: usize,
    used: usize,
}

impl SessionAllocator {
    pub fn new(budget: usize) -> Self {
        Self { budget, used: 0 }
    }

    /// Account for `bytes` of payload
    pub fn charge(&mut self, bytes: usize) -> CregResult<()> {
        let used = self.used.saturating_add(bytes);
        if used > self.budget {
            return Err(CregError::CapacityExceeded {
                what: "script heap bytes",
                limit: self.budget,
            });
        }
        self.used = used;
        Ok(())
    }

    /// Reserve room for `additional` elements, charged to the budget
    pub fn reserve<T>(&mut self, vec: &mut Vec<T>, additional: usize) -> CregResult<()> {
        self.charge(additional.saturating_mul(std::mem::size_of::<T>()))?;
        vec.reserve(additional);
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl Drop for SessionAllocator {
    fn drop(&mut self) {
        log::trace!("session allocator released, {} of {} bytes used", self.used, self.budget);
    }
}

/// Counters reported at the end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub strings: usize,
    pub payloads: usize,
    pub references: usize,
    pub heap_bytes: usize,
}

/// State shared by every hook of one save or load
pub struct ScriptSession {
    pub strings: StringTable,
    pub natives: Arc<NativeRegistry>,
    pub allocator: SessionAllocator,
}

impl ScriptSession {
    pub fn new(natives: Arc<NativeRegistry>, options: &ScriptOptions) -> Self {
        Self {
            strings: StringTable::new(options.max_strings),
            natives,
            allocator: SessionAllocator::new(options.max_heap_bytes),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            strings: self.strings.len(),
            payloads: self.strings.payloads(),
            references: self.strings.references(),
            heap_bytes: self.allocator.used(),
        }
    }
}

/// The session attached to a serializer
pub(crate) fn session_of(s: &mut dyn Serializer) -> CregResult<&mut ScriptSession> {
    s.context_as::<ScriptSession>()
        .ok_or(CregError::MissingContext("script session"))
}
