//! Class registrations for the interpreter heap

use std::sync::Arc;

use creg_core::{ignored, member, ClassBuilder, ClassRegistry, CregResult, RegistryBuilder};

use crate::function::{
    serialize_native_closure, serialize_upval, Closure, LocVar, LuaClosure, NativeClosure, Proto,
    UpVal,
};
use crate::state::GlobalState;
use crate::table::{serialize_table, table_loaded, Node, Table};
use crate::thread::{serialize_thread, thread_loaded, CallInfo, Thread};
use crate::userdata::{serialize_userdata, Userdata};
use crate::value::{serialize_lua_str, serialize_tvalue, LuaStr, Value};

/// Add every interpreter class to `builder`
pub fn register_script_classes(builder: &mut RegistryBuilder) -> CregResult<()> {
    builder
        .register(ClassBuilder::<LuaStr>::new().serializer(serialize_lua_str).build())?
        .register(ClassBuilder::<Value>::new().serializer(serialize_tvalue).build())?
        .register(
            ClassBuilder::<Node>::new()
                .field(member!(Node, key))
                .field(member!(Node, value))
                .build(),
        )?
        .register(
            ClassBuilder::<Table>::new()
                .field(member!(Table, flags))
                .field(member!(Table, metatable))
                .field(member!(Table, array))
                .serializer(serialize_table)
                .post_load(table_loaded)
                .build(),
        )?;

    builder
        .register(
            ClassBuilder::<LocVar>::new()
                .field(member!(LocVar, name))
                .field(member!(LocVar, start_pc))
                .field(member!(LocVar, end_pc))
                .build(),
        )?
        .register(
            ClassBuilder::<Proto>::new()
                .field(member!(Proto, constants))
                .field(member!(Proto, code))
                .field(member!(Proto, protos))
                .field(member!(Proto, line_info))
                .field(member!(Proto, locals))
                .field(member!(Proto, upvalue_names))
                .field(member!(Proto, source))
                .field(member!(Proto, line_defined))
                .field(member!(Proto, last_line_defined))
                .field(member!(Proto, num_upvalues))
                .field(member!(Proto, num_params))
                .field(member!(Proto, is_vararg))
                .field(member!(Proto, max_stack_size))
                .build(),
        )?
        .register(
            ClassBuilder::<Closure>::abstract_class()
                .field(member!(Closure, env))
                .build(),
        )?
        .register(
            ClassBuilder::<LuaClosure>::new()
                .base(|c: &mut LuaClosure| &mut c.closure)
                .field(member!(LuaClosure, proto))
                .field(member!(LuaClosure, upvalues))
                .build(),
        )?
        .register(
            ClassBuilder::<NativeClosure>::new()
                .base(|c: &mut NativeClosure| &mut c.closure)
                .field(ignored!(NativeClosure, function))
                .field(member!(NativeClosure, upvalues))
                .serializer(serialize_native_closure)
                .build(),
        )?
        .register(ClassBuilder::<UpVal>::new().serializer(serialize_upval).build())?
        .register(
            ClassBuilder::<Userdata>::new()
                .field(member!(Userdata, metatable))
                .field(member!(Userdata, env))
                .serializer(serialize_userdata)
                .build(),
        )?;

    builder
        .register(
            ClassBuilder::<CallInfo>::new()
                .field(member!(CallInfo, base))
                .field(member!(CallInfo, top))
                .field(member!(CallInfo, func))
                .field(member!(CallInfo, saved_pc))
                .field(member!(CallInfo, n_results))
                .field(member!(CallInfo, tail_calls))
                .build(),
        )?
        .register(
            ClassBuilder::<Thread>::new()
                .field(member!(Thread, status))
                .field(member!(Thread, stack))
                .field(member!(Thread, stack_size))
                .field(member!(Thread, frames))
                .field(member!(Thread, n_c_calls))
                .field(member!(Thread, base_c_calls))
                .field(member!(Thread, hook_mask))
                .field(member!(Thread, allow_hook))
                .field(member!(Thread, base_hook_count))
                .field(member!(Thread, hook_count))
                .field(ignored!(Thread, hook))
                .field(member!(Thread, globals))
                .field(member!(Thread, open_upvalues))
                .field(member!(Thread, error_func))
                .serializer(serialize_thread)
                .post_load(thread_loaded)
                .build(),
        )?
        .register(
            ClassBuilder::<GlobalState>::new()
                .field(member!(GlobalState, current_white))
                .field(member!(GlobalState, gc_state))
                .field(member!(GlobalState, gc_threshold))
                .field(member!(GlobalState, total_bytes))
                .field(member!(GlobalState, estimate))
                .field(member!(GlobalState, gc_debt))
                .field(member!(GlobalState, gc_pause))
                .field(member!(GlobalState, gc_step_mul))
                .field(member!(GlobalState, registry))
                .field(member!(GlobalState, globals))
                .field(member!(GlobalState, main_thread))
                .field(member!(GlobalState, metatables))
                .field(member!(GlobalState, tag_method_names))
                .build(),
        )?;
    Ok(())
}

/// Finalized registry holding only the interpreter classes
pub fn script_registry() -> CregResult<Arc<ClassRegistry>> {
    let mut builder = RegistryBuilder::new();
    register_script_classes(&mut builder)?;
    Ok(Arc::new(builder.finalize()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_shape() {
        let registry = script_registry().unwrap();
        assert_eq!(registry.len(), 14);

        let closure = registry.require("Closure").unwrap();
        let lua = registry.require("LClosure").unwrap();
        let native = registry.require("CClosure").unwrap();
        assert!(registry.is_a(lua, closure));
        assert!(registry.is_a(native, closure));
        assert!(!registry.is_a(lua, native));
        assert!(!registry.class(closure).is_constructible());

        let table = registry.lookup("Table").unwrap();
        assert!(table.has_serializer());
        assert!(table.has_post_load());
        assert_eq!(
            registry.lookup("Thread").unwrap().field("hook").unwrap().ty().signature(),
            format!("ignored[{}]", std::mem::size_of::<Option<crate::thread::DebugHook>>())
        );
    }
}
