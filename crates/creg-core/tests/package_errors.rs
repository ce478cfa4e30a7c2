//! Rejection of malformed graphs and incompatible packages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use creg_core::{
    impl_embedded, load_package, member, save_package, ClassBuilder, ClassRegistry, CregError,
    CregResult, ErrorCategory, ObjectGraph, OutputSerializer, Ptr, Reflect, RegistryBuilder,
    SessionOptions, Serializer,
};

#[derive(Default)]
struct Point {
    x: i32,
    y: i32,
}

impl Reflect for Point {
    const CLASS: &'static str = "Point";
}

impl_embedded!(Point);

#[derive(Default)]
struct Node {
    label: String,
    next: Ptr<Node>,
    weight: i32,
}

impl Reflect for Node {
    const CLASS: &'static str = "Node";
}

#[derive(Default)]
struct Twice {
    at: Point,
}

impl Reflect for Twice {
    const CLASS: &'static str = "Twice";
}

fn write_point_again(twice: &mut Twice, s: &mut dyn Serializer) -> CregResult<()> {
    s.serialize_instance(&mut twice.at)
}

#[derive(Default)]
struct Holder {
    nodes: Vec<Ptr<Node>>,
    other: Ptr<Twice>,
}

impl Reflect for Holder {
    const CLASS: &'static str = "Holder";
}

fn node_class(with_weight: bool) -> creg_core::ClassDescriptor {
    let builder = ClassBuilder::<Node>::new()
        .field(member!(Node, label))
        .field(member!(Node, next));
    if with_weight {
        builder.field(member!(Node, weight)).build()
    } else {
        builder.build()
    }
}

fn registry() -> Arc<ClassRegistry> {
    let registry = RegistryBuilder::new()
        .with(node_class(true))
        .unwrap()
        .with(ClassBuilder::<Point>::new().field(member!(Point, x)).field(member!(Point, y)).build())
        .unwrap()
        .with(
            ClassBuilder::<Twice>::new()
                .field(member!(Twice, at))
                .serializer(write_point_again)
                .build(),
        )
        .unwrap()
        .with(
            ClassBuilder::<Holder>::new()
                .field(member!(Holder, nodes))
                .field(member!(Holder, other))
                .build(),
        )
        .unwrap()
        .finalize()
        .unwrap();
    Arc::new(registry)
}

/// Single node pointing at itself, empty label
fn self_loop(registry: &Arc<ClassRegistry>) -> Vec<u8> {
    let mut graph = ObjectGraph::new(registry.clone());
    let node = graph.insert(Node::default()).unwrap();
    graph.get_mut(node).unwrap().next = node;
    save_package(&mut graph, node.raw().unwrap()).unwrap()
}

#[test]
fn test_checksum_mismatch_rejected() {
    let writer = registry();
    let bytes = self_loop(&writer);

    let reader = Arc::new(
        RegistryBuilder::new()
            .with(node_class(false))
            .unwrap()
            .finalize()
            .unwrap(),
    );
    let err = load_package(&reader, &bytes).unwrap_err();
    assert!(matches!(err, CregError::ChecksumMismatch { .. }));
    assert_eq!(err.category(), ErrorCategory::Compatibility);
}

/// `Node` with `weight` widened from i32 to i64
#[derive(Default)]
struct WideNode {
    label: String,
    next: Ptr<WideNode>,
    weight: i64,
}

impl Reflect for WideNode {
    const CLASS: &'static str = "Node";
}

#[test]
fn test_field_type_change_rejected() {
    let writer = registry();
    let bytes = self_loop(&writer);

    let reader = Arc::new(
        RegistryBuilder::new()
            .with(
                ClassBuilder::<WideNode>::new()
                    .field(member!(WideNode, label))
                    .field(member!(WideNode, next))
                    .field(member!(WideNode, weight))
                    .build(),
            )
            .unwrap()
            .finalize()
            .unwrap(),
    );
    let checksum = |r: &ClassRegistry| r.lookup("Node").unwrap().checksum();
    assert_ne!(checksum(&*writer), checksum(&*reader));
    assert!(matches!(
        load_package(&reader, &bytes),
        Err(CregError::ChecksumMismatch { .. })
    ));
}

static COUNTED_BUILT: AtomicUsize = AtomicUsize::new(0);

struct Counted {
    value: i32,
}

impl Default for Counted {
    fn default() -> Self {
        COUNTED_BUILT.fetch_add(1, Ordering::SeqCst);
        Counted { value: 0 }
    }
}

impl Reflect for Counted {
    const CLASS: &'static str = "Counted";
}

impl_embedded!(Counted);

#[derive(Default)]
struct Bag {
    items: Vec<Counted>,
    values: Vec<i64>,
}

impl Reflect for Bag {
    const CLASS: &'static str = "Bag";
}

#[test]
fn test_oversized_array_length_rejected() {
    let registry = Arc::new(
        RegistryBuilder::new()
            .with(ClassBuilder::<Counted>::new().field(member!(Counted, value)).build())
            .unwrap()
            .with(
                ClassBuilder::<Bag>::new()
                    .field(member!(Bag, items))
                    .field(member!(Bag, values))
                    .build(),
            )
            .unwrap()
            .finalize()
            .unwrap(),
    );
    let mut graph = ObjectGraph::new(registry.clone());
    let root = graph
        .insert(Bag {
            items: Vec::new(),
            values: vec![1, 2],
        })
        .unwrap();
    let bytes = save_package(&mut graph, root.raw().unwrap()).unwrap();
    assert!(load_package(&registry, &bytes).is_ok());

    // data section: items length, values length, two values
    let mut items = bytes.clone();
    items[32..40].copy_from_slice(&5_000_000i64.to_le_bytes());
    let before = COUNTED_BUILT.load(Ordering::SeqCst);
    assert!(matches!(
        load_package(&registry, &items),
        Err(CregError::Corrupt(message)) if message.contains("embedded objects")
    ));
    assert_eq!(COUNTED_BUILT.load(Ordering::SeqCst), before);

    let mut values = bytes;
    values[40..48].copy_from_slice(&5_000_000i64.to_le_bytes());
    assert!(matches!(
        load_package(&registry, &values),
        Err(CregError::Corrupt(message)) if message.contains("bytes")
    ));
}

#[test]
fn test_unknown_class_rejected() {
    let bytes = self_loop(&registry());
    let reader = Arc::new(
        RegistryBuilder::new()
            .with(ClassBuilder::<Point>::new().field(member!(Point, x)).build())
            .unwrap()
            .finalize()
            .unwrap(),
    );
    assert!(matches!(
        load_package(&reader, &bytes),
        Err(CregError::UnknownClass(name)) if name == "Node"
    ));
}

#[test]
fn test_truncated_and_bad_magic() {
    let registry = registry();
    let bytes = self_loop(&registry);

    assert!(matches!(
        load_package(&registry, &bytes[..bytes.len() - 3]),
        Err(CregError::Truncated { .. })
    ));
    assert!(matches!(
        load_package(&registry, &bytes[..10]),
        Err(CregError::Truncated { .. })
    ));

    let mut bad = bytes.clone();
    bad[0] = b'X';
    assert!(matches!(
        load_package(&registry, &bad),
        Err(CregError::InvalidMagic(_))
    ));

    let mut long = bytes;
    long.push(0);
    assert!(matches!(
        load_package(&registry, &long),
        Err(CregError::Corrupt(_))
    ));
}

#[test]
fn test_pointer_id_out_of_range() {
    let registry = registry();
    let mut bytes = self_loop(&registry);
    // data section: 8-byte empty label length, then the `next` id
    bytes[40..48].copy_from_slice(&9i64.to_le_bytes());
    assert!(matches!(
        load_package(&registry, &bytes),
        Err(CregError::ObjectIdOutOfRange { id: 9, count: 2 })
    ));

    bytes[40..48].copy_from_slice(&(1i64 << 40).to_le_bytes());
    assert!(matches!(
        load_package(&registry, &bytes),
        Err(CregError::ObjectIdOutOfRange { id, .. }) if id == 1 << 40
    ));
}

#[test]
fn test_embedding_twice_rejected() {
    let registry = registry();
    let mut graph = ObjectGraph::new(registry.clone());
    let root = graph.insert(Twice::default()).unwrap();
    let err = save_package(&mut graph, root.raw().unwrap()).unwrap_err();
    assert!(matches!(&err, CregError::ReserializedEmbedded(name) if name == "Point"));
    assert_eq!(err.category(), ErrorCategory::GraphShape);
}

#[test]
fn test_dangling_reference_rejected() {
    let registry = registry();
    let mut graph = ObjectGraph::new(registry.clone());
    let gone = graph.insert(Node::default()).unwrap();
    let root = graph
        .insert(Holder {
            nodes: vec![gone],
            other: Ptr::null(),
        })
        .unwrap();
    graph.remove(gone.raw().unwrap());
    assert!(matches!(
        save_package(&mut graph, root.raw().unwrap()),
        Err(CregError::DanglingReference(_))
    ));
}

#[test]
fn test_pointer_class_mismatch_rejected() {
    let registry = registry();
    let mut graph = ObjectGraph::new(registry.clone());
    let wrong = graph.insert(Twice::default()).unwrap();
    let root = graph
        .insert(Holder {
            nodes: vec![wrong.cast()],
            other: Ptr::null(),
        })
        .unwrap();
    assert!(matches!(
        save_package(&mut graph, root.raw().unwrap()),
        Err(CregError::ClassMismatch { expected, found }) if expected == "Node" && found == "Twice"
    ));
}

#[test]
fn test_object_limit() {
    let registry = registry();
    let mut graph = ObjectGraph::new(registry.clone());
    let nodes = (0..3)
        .map(|_| graph.insert(Node::default()).unwrap())
        .collect::<Vec<_>>();
    let root = graph
        .insert(Holder {
            nodes,
            other: Ptr::null(),
        })
        .unwrap();

    let options = SessionOptions {
        max_objects: 3,
        ..SessionOptions::default()
    };
    let mut sink = Vec::new();
    let result =
        OutputSerializer::new(&registry, &options).save(&mut graph, root.raw().unwrap(), &mut sink);
    assert!(matches!(
        result,
        Err(CregError::CapacityExceeded { what: "objects", limit: 3 })
    ));
    assert!(sink.is_empty());
}

#[test]
fn test_unregistered_type() {
    struct Stray;

    impl Reflect for Stray {
        const CLASS: &'static str = "Stray";
    }

    let mut graph = ObjectGraph::new(registry());
    assert!(matches!(
        graph.insert(Stray),
        Err(CregError::UnregisteredType(_))
    ));
}
