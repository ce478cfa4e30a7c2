//! Script tables
//!
//! A table keeps an array part for the keys `1..=n` and a hash part of
//! key/value nodes. Lookups into the hash part go through an index keyed by
//! [`TableKey`]; the index holds session-local object handles, so it is never
//! written and is rebuilt after a load.

use creg_core::{impl_embedded, CregError, CregResult, Ptr, Reflect, Serializer};
use rustc_hash::FxHashMap;

use crate::error::{ScriptError, ScriptResult};
use crate::session::session_of;
use crate::value::{TableKey, Value};

/// Hash-part entry; a nil value marks a dead slot that keeps its key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub key: Value,
    pub value: Value,
}

impl Reflect for Node {
    const CLASS: &'static str = "Node";
}

impl_embedded!(Node);

#[derive(Debug, Default)]
pub struct Table {
    /// Cached absence of metamethods, one bit per event
    pub flags: u8,
    pub metatable: Ptr<Table>,
    pub array: Vec<Value>,
    pub(crate) nodes: Vec<Node>,
    /// No dead node lies below this slot
    pub(crate) free: usize,
    index: FxHashMap<TableKey, usize>,
}

impl Reflect for Table {
    const CLASS: &'static str = "Table";
}

/// Zero-based array slot for an integral key `1..`
fn array_slot(key: &Value) -> Option<usize> {
    let n = key.as_number()?;
    if n >= 1.0 && n.fract() == 0.0 && n <= usize::MAX as f64 {
        Some(n as usize - 1)
    } else {
        None
    }
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an entry; absent keys and invalid keys read as nil
    pub fn get(&self, key: &Value) -> Value {
        if let Some(slot) = array_slot(key) {
            if let Some(value) = self.array.get(slot) {
                return value.clone();
            }
        }
        match TableKey::from_value(key) {
            Ok(k) => self
                .index
                .get(&k)
                .map(|&slot| self.nodes[slot].value.clone())
                .unwrap_or_default(),
            Err(_) => Value::Nil,
        }
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Value::String(crate::value::LuaStr::new(key.as_bytes())))
    }

    /// Write an entry; assigning nil removes it
    pub fn set(&mut self, key: Value, value: Value) -> ScriptResult<()> {
        let k = TableKey::from_value(&key).map_err(ScriptError::InvalidKey)?;
        if let Some(slot) = array_slot(&key) {
            if slot < self.array.len() {
                self.array[slot] = value;
                return Ok(());
            }
            if slot == self.array.len() && !value.is_nil() && !self.index.contains_key(&k) {
                self.array.push(value);
                return Ok(());
            }
        }

        match self.index.get(&k) {
            Some(&slot) => {
                if value.is_nil() {
                    self.free = self.free.min(slot);
                }
                self.nodes[slot].value = value;
            }
            None if value.is_nil() => {}
            None => {
                let slot = self.free_slot();
                if slot == self.nodes.len() {
                    self.nodes.push(Node { key, value });
                } else {
                    if let Ok(dead) = TableKey::from_value(&self.nodes[slot].key) {
                        self.index.remove(&dead);
                    }
                    self.nodes[slot] = Node { key, value };
                }
                self.index.insert(k, slot);
                self.free = slot + 1;
            }
        }
        Ok(())
    }

    /// First dead node at or above the cursor, or one past the end
    fn free_slot(&self) -> usize {
        (self.free..self.nodes.len())
            .find(|&i| self.nodes[i].value.is_nil())
            .unwrap_or(self.nodes.len())
    }

    /// Border of the array part
    pub fn len(&self) -> usize {
        self.array.iter().rposition(|v| !v.is_nil()).map_or(0, |i| i + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.nodes.iter().all(|n| n.value.is_nil())
    }

    /// Live entries, array part first
    pub fn entries(&self) -> Vec<(Value, Value)> {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Number((i + 1) as f64), v.clone()));
        let hash = self
            .nodes
            .iter()
            .filter(|n| !n.value.is_nil())
            .map(|n| (n.key.clone(), n.value.clone()));
        array.chain(hash).collect()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Rebuild the hash-part index from the nodes
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        for (slot, node) in self.nodes.iter().enumerate() {
            if let Ok(key) = TableKey::from_value(&node.key) {
                self.index.insert(key, slot);
            }
        }
    }
}

/// Hash part behind an empty flag, then the free cursor
pub(crate) fn serialize_table(table: &mut Table, s: &mut dyn Serializer) -> CregResult<()> {
    let mut empty = table.nodes.is_empty();
    s.serialize_bool(&mut empty)?;
    if empty {
        table.nodes.clear();
    } else {
        s.serialize_value(&mut table.nodes)?;
        if !s.is_writing() {
            let bytes = table.nodes.len() * std::mem::size_of::<Node>();
            session_of(s)?.allocator.charge(bytes)?;
        }
    }
    s.serialize_value(&mut table.free)?;
    if table.free > table.nodes.len() {
        return Err(CregError::Corrupt(format!(
            "free cursor {} beyond {} nodes",
            table.free,
            table.nodes.len()
        )));
    }
    Ok(())
}

pub(crate) fn table_loaded(table: &mut Table) -> CregResult<()> {
    table.rebuild_index();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::LuaStr;

    fn s(text: &str) -> Value {
        Value::String(LuaStr::new(text.as_bytes()))
    }

    #[test]
    fn test_array_part() {
        let mut table = Table::new();
        table.set(Value::Number(1.0), s("a")).unwrap();
        table.set(Value::Number(2.0), s("b")).unwrap();
        table.set(Value::Number(4.0), s("d")).unwrap();
        assert_eq!(table.array.len(), 2);
        assert_eq!(table.nodes().len(), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&Value::Number(4.0)), s("d"));
        assert_eq!(table.get(&Value::Number(3.0)), Value::Nil);
    }

    #[test]
    fn test_hash_part_reuses_dead_slots() {
        let mut table = Table::new();
        table.set(s("x"), Value::Number(1.0)).unwrap();
        table.set(s("y"), Value::Number(2.0)).unwrap();
        table.set(s("x"), Value::Nil).unwrap();
        assert_eq!(table.get_str("x"), Value::Nil);
        assert_eq!(table.free, 0);

        table.set(s("z"), Value::Number(3.0)).unwrap();
        assert_eq!(table.nodes().len(), 2);
        assert_eq!(table.nodes()[0].key, s("z"));
        assert_eq!(table.get_str("z"), Value::Number(3.0));
        assert_eq!(table.get_str("y"), Value::Number(2.0));
        assert_eq!(table.entries().len(), 2);
    }

    #[test]
    fn test_invalid_keys() {
        let mut table = Table::new();
        assert!(matches!(
            table.set(Value::Nil, Value::Number(1.0)),
            Err(ScriptError::InvalidKey("nil"))
        ));
        assert!(matches!(
            table.set(Value::Number(f64::NAN), Value::Number(1.0)),
            Err(ScriptError::InvalidKey("NaN"))
        ));
        assert_eq!(table.get(&Value::Nil), Value::Nil);
    }

    #[test]
    fn test_rebuild_index() {
        let mut table = Table::new();
        table.set(s("k"), Value::Boolean(true)).unwrap();
        table.set(Value::Boolean(false), s("v")).unwrap();
        table.index.clear();
        assert_eq!(table.get_str("k"), Value::Nil);
        table.rebuild_index();
        assert_eq!(table.get_str("k"), Value::Boolean(true));
        assert_eq!(table.get(&Value::Boolean(false)), s("v"));
    }
}
