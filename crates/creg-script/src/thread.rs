//! Threads (coroutines)
//!
//! A thread owns a value stack and a list of call frames. Frames address the
//! stack by offset and the saved program counter is an offset into the
//! running prototype's code, so nothing in a thread depends on addresses.

use creg_core::{
    impl_embedded, CregError, CregResult, DeduceType, Ptr, Reflect, ReflectEnum, Serializer,
    TypeDescriptor,
};

use crate::function::UpVal;
use crate::session::session_of;
use crate::state::Interpreter;
use crate::table::Table;
use crate::value::Value;

/// Debug hook installed on a thread
pub type DebugHook = fn(&mut Interpreter, Ptr<Thread>);

/// Call frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallInfo {
    /// First stack slot of the frame
    pub base: usize,
    pub top: usize,
    /// Slot of the called function
    pub func: usize,
    pub saved_pc: usize,
    pub n_results: i32,
    pub tail_calls: i32,
}

impl Reflect for CallInfo {
    const CLASS: &'static str = "CallInfo";
}

impl_embedded!(CallInfo);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadStatus {
    #[default]
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrErr,
}

impl ReflectEnum for ThreadStatus {
    const NAME: &'static str = "ThreadStatus";

    fn to_raw(self) -> i64 {
        self as i64
    }

    fn from_raw(raw: i64) -> Option<Self> {
        Some(match raw {
            0 => ThreadStatus::Ok,
            1 => ThreadStatus::Yield,
            2 => ThreadStatus::ErrRun,
            3 => ThreadStatus::ErrSyntax,
            4 => ThreadStatus::ErrMem,
            5 => ThreadStatus::ErrErr,
            _ => return None,
        })
    }
}

impl DeduceType for ThreadStatus {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::enumeration::<Self>()
    }
}

#[derive(Debug, Default)]
pub struct Thread {
    pub status: ThreadStatus,
    pub stack: Vec<Value>,
    /// Reserved stack capacity
    pub stack_size: usize,
    pub frames: Vec<CallInfo>,
    pub n_c_calls: u16,
    pub base_c_calls: u16,
    pub hook_mask: u8,
    pub allow_hook: bool,
    pub base_hook_count: i32,
    pub hook_count: i32,
    pub hook: Option<DebugHook>,
    pub globals: Ptr<Table>,
    /// Head of the open upvalue list
    pub open_upvalues: Ptr<UpVal>,
    /// Stack slot of the error handler, zero if none
    pub error_func: usize,
}

impl Reflect for Thread {
    const CLASS: &'static str = "Thread";
}

impl Thread {
    pub fn new(globals: Ptr<Table>, stack_size: usize) -> Self {
        Self {
            stack: Vec::with_capacity(stack_size),
            stack_size,
            globals,
            allow_hook: true,
            ..Default::default()
        }
    }

    pub fn push(&mut self, value: Value) -> usize {
        self.stack.push(value);
        self.stack.len() - 1
    }

    pub fn current_frame(&self) -> Option<&CallInfo> {
        self.frames.last()
    }
}

/// Rejects live debug hooks; on load, reserves the stack through the
/// session allocator
pub(crate) fn serialize_thread(thread: &mut Thread, s: &mut dyn Serializer) -> CregResult<()> {
    if s.is_writing() {
        if thread.hook.is_some() {
            return Err(CregError::UnsupportedValue(
                "thread with a live debug hook".into(),
            ));
        }
        return Ok(());
    }
    let additional = thread.stack_size.saturating_sub(thread.stack.len());
    session_of(s)?
        .allocator
        .reserve(&mut thread.stack, additional)
}

/// Frame offsets must stay within the loaded stack
pub(crate) fn thread_loaded(thread: &mut Thread) -> CregResult<()> {
    let len = thread.stack.len();
    for (depth, frame) in thread.frames.iter().enumerate() {
        if frame.func > frame.base || frame.base > frame.top || frame.top > len.max(thread.stack_size)
        {
            return Err(CregError::Corrupt(format!(
                "frame {depth} (func {}, base {}, top {}) outside stack of {len}",
                frame.func, frame.base, frame.top
            )));
        }
    }
    Ok(())
}
