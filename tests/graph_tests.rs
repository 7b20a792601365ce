#![allow(missing_docs)]

use rowcode::{
    Binary, DeferredState, DeferredValue, Rowcode, SharedCell, SharedList, Value,
};

// --- HELPERS ---

fn wire(root: Value) -> Vec<u8> {
    Rowcode::encode_to_vec(root).expect("encode failed")
}

fn transit(root: Value) -> Value {
    Rowcode::decode_from_slice(&wire(root)).expect("decode failed")
}

// --- TESTS ---

/// Aliased objects / Validate one row, two references, one decoded storage.
#[test]
fn shared_objects_decode_to_one_identity() {
    let inner = Value::object([("deep", Value::from(true))]);
    let root = Value::object([("x", inner.clone()), ("y", inner)]);

    assert_eq!(
        wire(root.clone()),
        b"1:{\"deep\":true}\n0:{\"x\":\"$1\",\"y\":\"$1\"}\n"
    );

    let back = transit(root);
    let x = back.get("x").expect("x field");
    let y = back.get("y").expect("y field");
    assert!(Value::ptr_eq(&x, &y));
    assert_eq!(x.get("deep"), Some(Value::from(true)));
}

/// Aliased arrays stay aliased: a write through one handle shows in all.
#[test]
fn shared_arrays_decode_to_one_identity() {
    let shared = Value::array([Value::from(1)]);
    let root = Value::array([shared.clone(), shared.clone(), shared]);

    assert_eq!(wire(root.clone()), b"1:[1]\n0:[\"$1\",\"$1\",\"$1\"]\n");

    let back = transit(root);
    let items = back.as_array().expect("array root").snapshot();
    assert!(Value::ptr_eq(&items[0], &items[1]));
    assert!(Value::ptr_eq(&items[1], &items[2]));

    let first = items[0].as_array().expect("inner array");
    first.set(0, Value::from(99)).expect("in bounds");
    assert_eq!(items[2].index(0), Some(Value::from(99)));
}

/// Cycle through an explicit cell / Validate the self-reference fixup.
#[test]
fn cycles_restore_through_shared_cells() {
    let cell = SharedCell::empty();
    let node = Value::object([
        ("name", Value::from("loop")),
        ("me", Value::from(cell.clone())),
    ]);
    cell.set(node);

    let bytes = wire(Value::from(cell));
    assert_eq!(bytes, b"1:{\"name\":\"loop\",\"me\":\"$1\"}\n0:\"$1\"\n");

    let back = Rowcode::decode_from_slice(&bytes).expect("decode failed");
    assert_eq!(back.get("name"), Some(Value::from("loop")));
    let me = back.get("me").expect("me field");
    assert!(Value::ptr_eq(&back, &me));
    assert!(Value::ptr_eq(&me, &me.get("me").expect("me.me")));
}

/// A list that contains itself survives without an explicit cell.
#[test]
fn self_referential_arrays_restore_their_cycle() {
    let list = SharedList::from_vec(vec![Value::Null, Value::from("tail")]);
    list.set(0, Value::Array(list.clone())).expect("in bounds");
    let root = Value::Array(list);

    assert_eq!(wire(root.clone()), b"0:[\"$0\",\"tail\"]\n");

    let back = transit(root);
    let back_list = back.as_array().expect("array root");
    let head = back_list.get(0).expect("head");
    assert!(Value::ptr_eq(&back, &head));
    assert_eq!(back_list.get(1), Some(Value::from("tail")));
}

/// A container reachable by several paths writes once, first path included.
#[test]
fn repeated_plain_containers_outline_once() {
    let item = Value::object([("sku", Value::from("a-1"))]);
    let root = Value::array([item.clone(), item.clone(), item, Value::from("x")]);

    assert_eq!(
        wire(root.clone()),
        b"1:{\"sku\":\"a-1\"}\n0:[\"$1\",\"$1\",\"$1\",\"x\"]\n"
    );

    let back = transit(root);
    let items = back.as_array().expect("array root").snapshot();
    assert!(Value::ptr_eq(&items[0], &items[1]));
    assert!(Value::ptr_eq(&items[1], &items[2]));
    assert_eq!(items[3], Value::from("x"));
}

/// Two references to one deferred cell share one task and one row.
#[test]
fn deferred_values_dedup_by_cell() {
    let cell = DeferredValue::fulfilled(Value::from(5));
    let root = Value::array([Value::from(cell.clone()), Value::from(cell)]);

    assert_eq!(wire(root.clone()), b"0:[\"$@1\",\"$@1\"]\n1:5\n");

    let back = transit(root);
    let items = back.as_array().expect("array root").snapshot();
    for site in &items {
        let deferred = site.as_deferred().expect("deferred site");
        let DeferredState::Fulfilled(value) = deferred.state() else {
            panic!("deferred not fulfilled: {:?}", deferred.state());
        };
        assert_eq!(value, Value::from(5));
    }
}

/// Aliasing holds across rows, deferred payloads included.
#[test]
fn cross_row_references_share_storage() {
    let shared = Value::object([("deep", Value::from(true))]);
    let later = DeferredValue::fulfilled(Value::array([shared.clone()]));
    let root = Value::object([
        ("now", Value::array([shared.clone(), shared])),
        ("later", Value::from(later)),
    ]);

    let bytes = wire(root);
    assert_eq!(
        bytes,
        b"1:{\"deep\":true}\n0:{\"now\":[\"$1\",\"$1\"],\"later\":\"$@2\"}\n2:[\"$1\"]\n"
    );

    let back = Rowcode::decode_from_slice(&bytes).expect("decode failed");
    let now = back.get("now").expect("now field");
    let a = now.index(0).expect("now[0]");
    let b = now.index(1).expect("now[1]");
    assert!(Value::ptr_eq(&a, &b));

    let later = back.get("later").expect("later field");
    let DeferredState::Fulfilled(list) = later.as_deferred().expect("deferred").state() else {
        panic!("later not fulfilled");
    };
    let c = list.index(0).expect("later[0]");
    assert!(Value::ptr_eq(&a, &c));
}

/// Binary payloads dedup by their backing allocation.
#[test]
fn identity_of_binary_data_is_shared() {
    let binary = Binary::buffer(vec![1, 2, 3]);
    let root = Value::array([Value::from(binary.clone()), Value::from(binary)]);

    let mut expected = Vec::new();
    expected.extend_from_slice(b"1:A3,\x01\x02\x03");
    expected.extend_from_slice(b"0:[\"$1\",\"$1\"]\n");
    assert_eq!(wire(root.clone()), expected);

    let back = transit(root);
    let items = back.as_array().expect("array root").snapshot();
    assert!(Value::ptr_eq(&items[0], &items[1]));
}
