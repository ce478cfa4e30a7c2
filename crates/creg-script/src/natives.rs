//! Native function registry
//!
//! Native closures hold a plain function pointer, which has no meaning in
//! another process. The registry maps every known native function to a stable
//! name so a snapshot can store the name and a load can bind it again.

use rustc_hash::FxHashMap;

use crate::error::{ScriptError, ScriptResult};
use crate::function::{Closure, NativeClosure};
use crate::state::Interpreter;
use crate::table::Table;
use crate::value::{TableKey, Value};
use creg_core::Ptr;

/// Host function callable from scripts
pub type NativeFn = fn(&mut Interpreter, &[Value]) -> ScriptResult<Vec<Value>>;

/// Deepest nesting [`NativeRegistry::auto_register`] descends to
pub const MAX_AUTO_REGISTER_DEPTH: usize = 7;

fn fn_key(f: NativeFn) -> usize {
    f as usize
}

/// Bidirectional map between native functions and their names
#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    /// Functions indexed by name
    by_name: FxHashMap<String, NativeFn>,
    /// Preferred name per function address
    by_fn: FxHashMap<usize, String>,
}

impl NativeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native function under a name
    ///
    /// Binding a name twice to the same function is accepted. A function
    /// registered under several names is saved under the shortest one.
    ///
    /// # Arguments
    /// * `name` - Stable name stored in snapshots (e.g. "Spring.GetUnitHealth")
    /// * `f` - The host function
    ///
    /// # Returns
    /// * `Ok(true)` - The name was new
    /// * `Ok(false)` - The name was already bound to `f`
    /// * `Err(ScriptError::NativeNameConflict)` - The name is bound to another function
    pub fn register(&mut self, name: impl Into<String>, f: NativeFn) -> ScriptResult<bool> {
        let name = name.into();
        if let Some(&existing) = self.by_name.get(&name) {
            if fn_key(existing) != fn_key(f) {
                return Err(ScriptError::NativeNameConflict(name));
            }
            return Ok(false);
        }

        match self.by_fn.get_mut(&fn_key(f)) {
            Some(current) => {
                log::warn!("native function registered as both `{}` and `{}`", current, name);
                if name.len() < current.len() {
                    *current = name.clone();
                }
            }
            None => {
                self.by_fn.insert(fn_key(f), name.clone());
            }
        }
        self.by_name.insert(name, f);
        Ok(true)
    }

    /// Function bound to a name
    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.by_name.get(name).copied()
    }

    /// Name a function is saved under
    pub fn name_of(&self, f: NativeFn) -> Option<&str> {
        self.by_fn.get(&fn_key(f)).map(String::as_str)
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Register every native function reachable from the globals table and
    /// the registry value, named by its access path
    ///
    /// Table entries are named `<prefix><key>`, nested tables add a `.`,
    /// metatables add `.__mt.` and native-closure upvalues add `::<n>`.
    /// Returns the number of new names.
    pub fn auto_register(&mut self, interp: &Interpreter, prefix: &str) -> ScriptResult<usize> {
        let before = self.len();
        let global = interp.global()?;
        self.walk_table(interp, prefix, global.globals, 0)?;
        if let Some(registry) = global.registry.as_table() {
            self.walk_table(interp, prefix, registry, 0)?;
        }
        let added = self.len() - before;
        log::debug!("auto-registered {} native functions under `{}`", added, prefix);
        Ok(added)
    }

    fn walk_table(
        &mut self,
        interp: &Interpreter,
        handle: &str,
        table: Ptr<Table>,
        depth: usize,
    ) -> ScriptResult<()> {
        if depth > MAX_AUTO_REGISTER_DEPTH {
            return Ok(());
        }
        let Some(entries) = interp.graph().get(table).map(Table::entries) else {
            return Ok(());
        };

        for (key, value) in entries {
            let key = match TableKey::from_value(&key) {
                Ok(TableKey::String(s)) => s.to_string(),
                Ok(TableKey::Number(_)) => format!("{}", key.as_number().unwrap_or(0.0) as i64),
                _ => continue,
            };
            match &value {
                Value::Function(f) => {
                    self.walk_function(interp, &format!("{handle}{key}"), *f, depth + 1)?;
                }
                Value::Table(t) => {
                    if key == "_G" && depth > 1 {
                        continue;
                    }
                    self.walk_table(interp, &format!("{handle}{key}."), *t, depth + 1)?;
                }
                _ => {}
            }
            if let Some(metatable) = interp.metatable_of(&value) {
                self.walk_table(interp, &format!("{handle}{key}.__mt."), metatable, depth + 1)?;
            }
        }
        Ok(())
    }

    fn walk_function(
        &mut self,
        interp: &Interpreter,
        handle: &str,
        function: Ptr<Closure>,
        depth: usize,
    ) -> ScriptResult<()> {
        if depth > MAX_AUTO_REGISTER_DEPTH {
            return Ok(());
        }
        let Some(closure) = function
            .raw()
            .and_then(|r| interp.graph().get_as::<NativeClosure>(r))
        else {
            return Ok(());
        };
        if let Some(f) = closure.function {
            self.register(handle, f)?;
        }
        for (i, upvalue) in closure.upvalues.iter().enumerate() {
            let handle = format!("{handle}::{}", i + 1);
            match upvalue {
                Value::Function(f) => self.walk_function(interp, &handle, *f, depth + 1)?,
                Value::Table(t) => self.walk_table(interp, &handle, *t, depth + 1)?,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(_: &mut Interpreter, _: &[Value]) -> ScriptResult<Vec<Value>> {
        Ok(vec![Value::Number(1.0)])
    }

    fn second(_: &mut Interpreter, _: &[Value]) -> ScriptResult<Vec<Value>> {
        Ok(vec![Value::Number(2.0)])
    }

    #[test]
    fn test_register_and_lookup() {
        let mut natives = NativeRegistry::new();
        assert!(natives.register("math.first", first).unwrap());
        assert!(!natives.register("math.first", first).unwrap());
        assert!(matches!(
            natives.register("math.first", second),
            Err(ScriptError::NativeNameConflict(name)) if name == "math.first"
        ));
        assert_eq!(natives.name_of(first), Some("math.first"));
        assert!(natives.get("math.first").is_some());
        assert!(natives.name_of(second).is_none());
    }

    #[test]
    fn test_shorter_alias_wins() {
        let mut natives = NativeRegistry::new();
        natives.register("library.helpers.first", first).unwrap();
        natives.register("first", first).unwrap();
        natives.register("first.with.long.name", first).unwrap();
        assert_eq!(natives.name_of(first), Some("first"));
        assert_eq!(natives.len(), 3);
    }
}
