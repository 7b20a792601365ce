#![allow(missing_docs)]

use rowcode::{
    Binary, BinaryKind, DecodeOptions, DeferredState, DeferredValue, EncodeOptions, FormEntry,
    FormPayload, Rowcode, RowcodeError, Value,
};

// --- TESTS ---

/// Prefixed fields / Validate the `<prefix><id>` naming convention.
#[test]
fn form_fields_round_trip_with_a_prefix() {
    let root = Value::object([("task", Value::from("ship")), ("count", Value::from(2))]);

    let payload = Rowcode::encode_to_form_fields_with(
        root.clone(),
        EncodeOptions {
            identifier_prefix: Some("f_".into()),
            ..Default::default()
        },
    )
    .expect("encode failed");
    assert!(payload.get("f_0").is_some());

    let back = Rowcode::decode_from_form_fields_with(
        &payload,
        DecodeOptions {
            identifier_prefix: Some("f_".into()),
            ..Default::default()
        },
    )
    .expect("decode failed");
    assert_eq!(back, root);
}

/// The form transport carries the full value model, not just JSON.
#[test]
fn every_token_class_survives_the_form_transport() {
    let root = Value::object([
        ("u", Value::Undefined),
        ("big", Value::from(9i128)),
        ("when", Value::Date("2026-01-01T00:00:00.000Z".into())),
        (
            "bin",
            Value::from(Binary::new(BinaryKind::F64, vec![0; 16]).expect("aligned")),
        ),
        ("m", Value::map([(Value::from("k"), Value::from(1))])),
        ("s", Value::set([Value::from(1), Value::from(2)])),
        ("text", Value::from("plain")),
    ]);

    let payload = Rowcode::encode_to_form_fields(root.clone()).expect("encode failed");
    let back = Rowcode::decode_from_form_fields(&payload).expect("decode failed");
    assert_eq!(back, root);
}

/// A form field already holds arbitrary length, so text never outlines.
#[test]
fn long_text_stays_inline_on_the_form_transport() {
    let text = "q".repeat(5000);

    let payload = Rowcode::encode_to_form_fields(Value::from(text.clone())).expect("encode failed");
    assert_eq!(payload.len(), 1);
    let FormEntry::Text(field) = payload.get("0").expect("root field") else {
        panic!("root field should be text");
    };
    assert_eq!(field, &format!("\"{text}\""));

    let back = Rowcode::decode_from_form_fields(&payload).expect("decode failed");
    assert_eq!(back, Value::from(text));
}

/// A reference without its field is a hard decode error, not a hang.
#[test]
fn missing_fields_fail_the_decode() {
    let mut payload = FormPayload::new();
    payload.append("0", FormEntry::Text("[\"$1\",\"$2\"]".into()));
    payload.append("1", FormEntry::Text("\"here\"".into()));

    let error = Rowcode::decode_from_form_fields(&payload).expect_err("row 2 is missing");
    assert!(matches!(error, RowcodeError::Format(_)));
    assert!(error.to_string().contains("never provided"));
}

/// Fields outside the session's prefix pass through untouched.
#[test]
fn foreign_fields_are_skipped() {
    let root = Value::object([("ok", Value::from(true))]);
    let mut payload = Rowcode::encode_to_form_fields_with(
        root.clone(),
        EncodeOptions {
            identifier_prefix: Some("f_".into()),
            ..Default::default()
        },
    )
    .expect("encode failed");
    payload.append("csrf", FormEntry::Text("token-123".into()));

    let back = Rowcode::decode_from_form_fields_with(
        &payload,
        DecodeOptions {
            identifier_prefix: Some("f_".into()),
            ..Default::default()
        },
    )
    .expect("decode failed");
    assert_eq!(back, root);
}

/// Both transports decode to the same graph, aliasing included.
#[test]
fn form_and_byte_transports_agree() {
    let item = Value::object([("sku", Value::from("a-1"))]);
    let root = Value::array([
        item.clone(),
        item,
        Value::map([(Value::from(1), Value::from("one"))]),
    ]);

    let bytes = Rowcode::encode_to_vec(root.clone()).expect("encode failed");
    let from_bytes = Rowcode::decode_from_slice(&bytes).expect("decode failed");
    let payload = Rowcode::encode_to_form_fields(root.clone()).expect("encode failed");
    let from_form = Rowcode::decode_from_form_fields(&payload).expect("decode failed");

    assert_eq!(from_bytes, root);
    assert_eq!(from_form, root);

    let items = from_form.as_array().expect("array root").snapshot();
    assert!(Value::ptr_eq(&items[0], &items[1]));
}

/// Settled sources flush without waiting; unsettled ones are a deadlock.
#[test]
fn unsettled_sources_deadlock_the_form_encode() {
    let ready = DeferredValue::fulfilled(Value::from(5));
    let payload =
        Rowcode::encode_to_form_fields(Value::from(ready)).expect("settled source flushes");
    let back = Rowcode::decode_from_form_fields(&payload).expect("decode failed");
    let DeferredState::Fulfilled(value) = back.as_deferred().expect("deferred").state() else {
        panic!("deferred should be fulfilled");
    };
    assert_eq!(value, Value::from(5));

    let pending = DeferredValue::new();
    let root = Value::object([("slow", Value::from(pending))]);
    let error = Rowcode::encode_to_form_fields(root).expect_err("unsettled source");
    assert!(matches!(error, RowcodeError::Deadlock(_)));
}
