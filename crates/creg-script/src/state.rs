//! Global state and the interpreter facade
//!
//! [`GlobalState`] is the root object of every interpreter snapshot. The
//! [`Interpreter`] owns the object graph holding it together with the native
//! registry and the snapshot options, and exposes the heap operations the
//! rest of the host needs: interning, allocation, table access and upvalue
//! management.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use creg_core::{
    ClassRegistry, InputSerializer, ObjRef, ObjectGraph, OutputSerializer, Ptr, Reflect,
};
use rustc_hash::FxHashSet;

use crate::error::{ScriptError, ScriptResult};
use crate::function::{Closure, LuaClosure, NativeClosure, Proto, UpVal, UpValState};
use crate::natives::{NativeFn, NativeRegistry};
use crate::options::ScriptOptions;
use crate::session::{ScriptSession, SessionStats};
use crate::table::Table;
use crate::thread::Thread;
use crate::userdata::{Userdata, UserdataPayload};
use crate::value::{LuaStr, Value, ValueKind};

/// Metamethod event names, indexed by event
pub const TAG_METHOD_NAMES: [&str; 17] = [
    "__index",
    "__newindex",
    "__gc",
    "__mode",
    "__eq",
    "__add",
    "__sub",
    "__mul",
    "__div",
    "__mod",
    "__pow",
    "__unm",
    "__len",
    "__lt",
    "__le",
    "__concat",
    "__call",
];

/// Initial stack capacity of a new thread
pub const BASIC_STACK_SIZE: usize = 40;

/// Content-addressed string pool
///
/// Strings with equal bytes share one buffer. The pool is not persisted; a
/// load rebuilds it from the session string table.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: FxHashSet<LuaStr>,
}

impl StringInterner {
    pub fn intern(&mut self, bytes: &[u8]) -> LuaStr {
        if let Some(existing) = self.strings.get(bytes) {
            return existing.clone();
        }
        let string = LuaStr::new(bytes);
        self.strings.insert(string.clone());
        string
    }

    /// Replace the pool with already shared strings
    pub fn rebuild(&mut self, strings: &[LuaStr]) {
        self.strings.clear();
        self.strings.extend(strings.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// State shared by all threads of one interpreter
#[derive(Debug, Default)]
pub struct GlobalState {
    pub strings: StringInterner,
    pub current_white: u8,
    pub gc_state: u8,
    pub gc_threshold: usize,
    pub total_bytes: usize,
    pub estimate: usize,
    pub gc_debt: usize,
    pub gc_pause: i32,
    pub gc_step_mul: i32,
    pub registry: Value,
    pub globals: Ptr<Table>,
    pub main_thread: Ptr<Thread>,
    /// Metatables for non-table, non-userdata values, indexed by kind
    pub metatables: [Ptr<Table>; ValueKind::COUNT],
    pub tag_method_names: Vec<LuaStr>,
}

impl Reflect for GlobalState {
    const CLASS: &'static str = "GlobalState";
}

/// Interpreter heap plus everything needed to snapshot it
pub struct Interpreter {
    graph: ObjectGraph,
    global: Ptr<GlobalState>,
    natives: Arc<NativeRegistry>,
    options: ScriptOptions,
}

impl Interpreter {
    /// Create an interpreter with a globals table, a registry table and a
    /// main thread
    pub fn new(
        registry: Arc<ClassRegistry>,
        natives: Arc<NativeRegistry>,
        options: ScriptOptions,
    ) -> ScriptResult<Self> {
        let mut graph = ObjectGraph::new(registry);
        let mut strings = StringInterner::default();

        let globals = graph.insert(Table::new())?;
        let registry_table = graph.insert(Table::new())?;
        let main_thread = graph.insert(Thread::new(globals, BASIC_STACK_SIZE))?;
        if let Some(table) = graph.get_mut(globals) {
            table.set(
                Value::String(strings.intern(b"_G")),
                Value::Table(globals),
            )?;
        }

        let tag_method_names = TAG_METHOD_NAMES
            .iter()
            .map(|name| strings.intern(name.as_bytes()))
            .collect();
        let global = graph.insert(GlobalState {
            strings,
            gc_pause: 200,
            gc_step_mul: 200,
            registry: Value::Table(registry_table),
            globals,
            main_thread,
            tag_method_names,
            ..Default::default()
        })?;

        Ok(Self {
            graph,
            global,
            natives,
            options,
        })
    }

    pub fn global(&self) -> ScriptResult<&GlobalState> {
        self.graph
            .get(self.global)
            .ok_or(ScriptError::StaleReference("global state"))
    }

    pub fn global_mut(&mut self) -> ScriptResult<&mut GlobalState> {
        self.graph
            .get_mut(self.global)
            .ok_or(ScriptError::StaleReference("global state"))
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        &mut self.graph
    }

    pub fn natives(&self) -> &Arc<NativeRegistry> {
        &self.natives
    }

    pub fn set_natives(&mut self, natives: Arc<NativeRegistry>) {
        self.natives = natives;
    }

    pub fn main_thread(&self) -> ScriptResult<Ptr<Thread>> {
        Ok(self.global()?.main_thread)
    }

    pub fn globals(&self) -> ScriptResult<Ptr<Table>> {
        Ok(self.global()?.globals)
    }

    /// Register every native function reachable from the globals and the
    /// registry value, keeping the names already known
    pub fn register_reachable_natives(&mut self, prefix: &str) -> ScriptResult<usize> {
        let mut natives = NativeRegistry::clone(&self.natives);
        let added = natives.auto_register(self, prefix)?;
        self.natives = Arc::new(natives);
        Ok(added)
    }

    pub fn intern(&mut self, text: impl AsRef<[u8]>) -> ScriptResult<LuaStr> {
        Ok(self.global_mut()?.strings.intern(text.as_ref()))
    }

    pub fn new_table(&mut self) -> ScriptResult<Ptr<Table>> {
        Ok(self.graph.insert(Table::new())?)
    }

    pub fn new_proto(&mut self, proto: Proto) -> ScriptResult<Ptr<Proto>> {
        Ok(self.graph.insert(proto)?)
    }

    /// Closure over `proto` with the globals as environment
    pub fn new_lua_closure(
        &mut self,
        proto: Ptr<Proto>,
        upvalues: Vec<Ptr<UpVal>>,
    ) -> ScriptResult<Ptr<Closure>> {
        let env = self.globals()?;
        let closure = self.graph.insert(LuaClosure {
            closure: Closure { env },
            proto,
            upvalues,
        })?;
        Ok(closure.cast())
    }

    pub fn new_native_closure(
        &mut self,
        function: NativeFn,
        upvalues: Vec<Value>,
    ) -> ScriptResult<Ptr<Closure>> {
        let env = self.globals()?;
        let closure = self.graph.insert(NativeClosure {
            closure: Closure { env },
            function: Some(function),
            upvalues,
        })?;
        Ok(closure.cast())
    }

    pub fn new_thread(&mut self) -> ScriptResult<Ptr<Thread>> {
        let globals = self.globals()?;
        Ok(self.graph.insert(Thread::new(globals, BASIC_STACK_SIZE))?)
    }

    pub fn new_userdata(&mut self, payload: UserdataPayload) -> ScriptResult<Ptr<Userdata>> {
        let env = self.globals()?;
        Ok(self.graph.insert(Userdata {
            metatable: Ptr::null(),
            env,
            payload,
        })?)
    }

    pub fn table(&self, table: Ptr<Table>) -> ScriptResult<&Table> {
        self.graph
            .get(table)
            .ok_or(ScriptError::StaleReference("table"))
    }

    pub fn table_mut(&mut self, table: Ptr<Table>) -> ScriptResult<&mut Table> {
        self.graph
            .get_mut(table)
            .ok_or(ScriptError::StaleReference("table"))
    }

    pub fn thread(&self, thread: Ptr<Thread>) -> ScriptResult<&Thread> {
        self.graph
            .get(thread)
            .ok_or(ScriptError::StaleReference("thread"))
    }

    pub fn thread_mut(&mut self, thread: Ptr<Thread>) -> ScriptResult<&mut Thread> {
        self.graph
            .get_mut(thread)
            .ok_or(ScriptError::StaleReference("thread"))
    }

    /// Script closure behind a function pointer, `None` for native closures
    pub fn lua_closure(&self, function: Ptr<Closure>) -> Option<&LuaClosure> {
        self.graph.get_as::<LuaClosure>(function.raw()?)
    }

    /// Native closure behind a function pointer, `None` for script closures
    pub fn native_closure(&self, function: Ptr<Closure>) -> Option<&NativeClosure> {
        self.graph.get_as::<NativeClosure>(function.raw()?)
    }

    pub fn table_get(&self, table: Ptr<Table>, key: &Value) -> ScriptResult<Value> {
        Ok(self.table(table)?.get(key))
    }

    pub fn table_set(&mut self, table: Ptr<Table>, key: Value, value: Value) -> ScriptResult<()> {
        self.table_mut(table)?.set(key, value)
    }

    pub fn get_global(&mut self, name: &str) -> ScriptResult<Value> {
        let key = Value::String(self.intern(name)?);
        let globals = self.globals()?;
        self.table_get(globals, &key)
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> ScriptResult<()> {
        let key = Value::String(self.intern(name)?);
        let globals = self.globals()?;
        self.table_set(globals, key, value)
    }

    pub fn set_metatable(&mut self, table: Ptr<Table>, metatable: Ptr<Table>) -> ScriptResult<()> {
        self.table_mut(table)?.metatable = metatable;
        Ok(())
    }

    /// Metatable of any value: own metatable for tables and userdata, the
    /// per-kind slot otherwise
    pub fn metatable_of(&self, value: &Value) -> Option<Ptr<Table>> {
        let metatable = match value {
            Value::Table(t) => self.graph.get(*t)?.metatable,
            Value::Userdata(u) => self.graph.get(*u)?.metatable,
            other => self.global().ok()?.metatables[other.kind() as usize],
        };
        (!metatable.is_null()).then_some(metatable)
    }

    /// Open upvalue for a stack slot of `thread`, created and linked into
    /// the open list if missing
    pub fn find_upvalue(&mut self, thread: Ptr<Thread>, slot: usize) -> ScriptResult<Ptr<UpVal>> {
        let mut prev: Ptr<UpVal> = Ptr::null();
        let mut cursor = self.thread(thread)?.open_upvalues;
        while let Some(upval) = self.graph.get(cursor) {
            let UpValState::Open {
                slot: open_slot,
                next,
                ..
            } = upval.state
            else {
                return Err(ScriptError::StaleReference("closed upvalue in open list"));
            };
            if open_slot == slot {
                return Ok(cursor);
            }
            if open_slot < slot {
                break;
            }
            prev = cursor;
            cursor = next;
        }

        let created = self.graph.insert(UpVal {
            state: UpValState::Open {
                thread,
                slot,
                prev,
                next: cursor,
            },
        })?;
        if prev.is_null() {
            self.thread_mut(thread)?.open_upvalues = created;
        } else {
            self.relink(prev, None, Some(created));
        }
        self.relink(cursor, Some(created), None);
        Ok(created)
    }

    fn relink(&mut self, upval: Ptr<UpVal>, new_prev: Option<Ptr<UpVal>>, new_next: Option<Ptr<UpVal>>) {
        if let Some(UpVal {
            state: UpValState::Open { prev, next, .. },
        }) = self.graph.get_mut(upval)
        {
            if let Some(p) = new_prev {
                *prev = p;
            }
            if let Some(n) = new_next {
                *next = n;
            }
        }
    }

    /// Close every open upvalue of `thread` at or above `level`, copying the
    /// stack values in. Returns the number closed.
    pub fn close_upvalues(&mut self, thread: Ptr<Thread>, level: usize) -> ScriptResult<usize> {
        let mut head = self.thread(thread)?.open_upvalues;
        let mut closed = 0;
        while let Some(upval) = self.graph.get(head) {
            let UpValState::Open { slot, next, .. } = upval.state else {
                return Err(ScriptError::StaleReference("closed upvalue in open list"));
            };
            if slot < level {
                break;
            }
            let value = self
                .thread(thread)?
                .stack
                .get(slot)
                .cloned()
                .unwrap_or_default();
            if let Some(upval) = self.graph.get_mut(head) {
                upval.state = UpValState::Closed(value);
            }
            head = next;
            closed += 1;
        }
        self.thread_mut(thread)?.open_upvalues = head;
        self.relink(head, Some(Ptr::null()), None);
        Ok(closed)
    }

    /// Current value of an upvalue
    pub fn upvalue_value(&self, upval: Ptr<UpVal>) -> ScriptResult<Value> {
        let upval = self
            .graph
            .get(upval)
            .ok_or(ScriptError::StaleReference("upvalue"))?;
        match &upval.state {
            UpValState::Closed(value) => Ok(value.clone()),
            UpValState::Open { thread, slot, .. } => {
                Ok(self.thread(*thread)?.stack.get(*slot).cloned().unwrap_or_default())
            }
        }
    }

    /// Invoke a native closure
    pub fn call_native(&mut self, function: Ptr<Closure>, args: &[Value]) -> ScriptResult<Vec<Value>> {
        let f = self
            .native_closure(function)
            .and_then(|c| c.function)
            .ok_or_else(|| ScriptError::NotCallable(format!("{function:?}")))?;
        f(self, args)
    }

    /// Write the whole interpreter state to `sink`
    pub fn save<W: Write>(&mut self, sink: &mut W) -> ScriptResult<SessionStats> {
        let root = self
            .global
            .raw()
            .ok_or(ScriptError::StaleReference("global state"))?;
        let registry = self.graph.registry().clone();
        let mut session = ScriptSession::new(self.natives.clone(), &self.options);
        let header = OutputSerializer::new(&registry, &self.options.session)
            .with_context(&mut session)
            .save(&mut self.graph, root, sink)?;

        let stats = session.stats();
        log::debug!(
            "saved interpreter state: {} objects, {} strings ({} references), checksum {:#010x}",
            header.object_count - 1,
            stats.strings,
            stats.references,
            header.metadata_checksum
        );
        Ok(stats)
    }

    pub fn save_to_file(&mut self, path: impl AsRef<Path>) -> ScriptResult<SessionStats> {
        let mut file = std::io::BufWriter::new(
            std::fs::File::create(path).map_err(creg_core::CregError::from)?,
        );
        self.save(&mut file)
    }

    /// Rebuild an interpreter from a snapshot
    pub fn load(
        registry: &Arc<ClassRegistry>,
        natives: Arc<NativeRegistry>,
        options: ScriptOptions,
        bytes: &[u8],
    ) -> ScriptResult<(Self, SessionStats)> {
        let mut session = ScriptSession::new(natives.clone(), &options);
        let loaded = InputSerializer::new(registry, &options.session)
            .with_context(&mut session)
            .load_bytes(bytes)?;

        let expected = registry.require(GlobalState::CLASS)?;
        if loaded.root_class != expected {
            return Err(ScriptError::UnexpectedRoot(
                registry.class(loaded.root_class).name().to_string(),
            ));
        }

        let stats = session.stats();
        let strings = session.strings.entries().to_vec();
        drop(session);

        let mut interp = Self {
            graph: loaded.graph,
            global: Ptr::new(loaded.root),
            natives,
            options,
        };
        interp.global_mut()?.strings.rebuild(&strings);
        interp.validate_frames()?;

        log::debug!(
            "loaded interpreter state: {} objects, {} strings, {} heap bytes",
            interp.graph.len(),
            stats.strings,
            stats.heap_bytes
        );
        Ok((interp, stats))
    }

    pub fn load_from_file(
        registry: &Arc<ClassRegistry>,
        natives: Arc<NativeRegistry>,
        options: ScriptOptions,
        path: impl AsRef<Path>,
    ) -> ScriptResult<(Self, SessionStats)> {
        let bytes = std::fs::read(path).map_err(creg_core::CregError::from)?;
        Self::load(registry, natives, options, &bytes)
    }

    /// Saved program counters must index an instruction of the running
    /// prototype's code
    fn validate_frames(&self) -> ScriptResult<()> {
        let threads: Vec<ObjRef> = self.graph.refs().collect();
        for r in threads {
            let Some(thread) = self.graph.get_as::<Thread>(r) else {
                continue;
            };
            for frame in &thread.frames {
                let Some(function) = thread.stack.get(frame.func).and_then(Value::as_function)
                else {
                    continue;
                };
                let Some(closure) = self.lua_closure(function) else {
                    continue;
                };
                let code_len = self.graph.get(closure.proto).map_or(0, |p| p.code.len());
                if frame.saved_pc >= code_len {
                    return Err(creg_core::CregError::Corrupt(format!(
                        "saved pc {} beyond code of {} instructions",
                        frame.saved_pc, code_len
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("graph", &self.graph)
            .field("natives", &self.natives.len())
            .finish()
    }
}
