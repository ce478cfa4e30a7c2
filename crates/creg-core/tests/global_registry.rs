//! Process-wide registry lifecycle

use std::sync::Arc;

use creg_core::{
    finalize_global, global_registry, load_package, member, register_global, save_package,
    ClassBuilder, CregError, ObjectGraph, Reflect,
};

#[derive(Default)]
struct Setting {
    key: String,
    value: i64,
}

impl Reflect for Setting {
    const CLASS: &'static str = "Setting";
}

#[test]
fn test_global_lifecycle() {
    assert!(global_registry().is_none());
    register_global(
        ClassBuilder::<Setting>::new()
            .field(member!(Setting, key))
            .field(member!(Setting, value))
            .build(),
    )
    .unwrap();
    assert!(matches!(
        register_global(ClassBuilder::<Setting>::new().build()),
        Err(CregError::DuplicateClass(_))
    ));

    let registry = finalize_global().unwrap();
    assert!(Arc::ptr_eq(&registry, &finalize_global().unwrap()));
    assert!(Arc::ptr_eq(&registry, &global_registry().unwrap()));
    assert!(matches!(
        register_global(ClassBuilder::<Setting>::new().build()),
        Err(CregError::RegistryFrozen)
    ));

    let mut graph = ObjectGraph::new(registry.clone());
    let root = graph
        .insert(Setting {
            key: "volume".into(),
            value: -12,
        })
        .unwrap();
    let bytes = save_package(&mut graph, root.raw().unwrap()).unwrap();
    let loaded = load_package(&registry, &bytes).unwrap();
    let setting = loaded.graph.get_as::<Setting>(loaded.root).unwrap();
    assert_eq!(setting.key, "volume");
    assert_eq!(setting.value, -12);
}
