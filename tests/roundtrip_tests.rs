#![allow(missing_docs)]

use std::sync::Arc;

use rowcode::{
    Binary, BinaryKind, BlobValue, EncodeOptions, ErrorValue, FormEntry, FormPayload, Rowcode,
    Value,
};

// --- HELPERS ---

/// Encodes a whole graph into wire bytes.
fn wire(root: Value) -> Vec<u8> {
    Rowcode::encode_to_vec(root).expect("encode failed")
}

/// Encodes and decodes in one hop.
fn transit(root: Value) -> Value {
    Rowcode::decode_from_slice(&wire(root)).expect("decode failed")
}

// --- TESTS ---

/// Plain JSON shapes / Validate the whole-value byte transport.
#[test]
fn json_values_survive_a_round_trip() {
    let root = Value::object([
        ("name", Value::from("atlas")),
        ("count", Value::from(3)),
        ("ratio", Value::from(0.25)),
        ("live", Value::from(true)),
        ("gone", Value::Null),
        (
            "tags",
            Value::array([Value::from("alpha"), Value::from("beta")]),
        ),
    ]);

    assert_eq!(transit(root.clone()), root);
}

/// Wire framing / Validate the `id:payload\n` row shape for inline graphs.
#[test]
fn the_wire_is_newline_framed_json_rows() {
    assert_eq!(wire(Value::from(42)), b"0:42\n");

    let root = Value::object([
        ("list", Value::array([Value::from(1), Value::from(2)])),
        ("ok", Value::from(true)),
    ]);
    assert_eq!(wire(root), b"0:{\"list\":[1,2],\"ok\":true}\n");
}

/// Non-JSON scalars / Validate the `$`-token forms and their decode.
#[test]
fn special_scalars_round_trip() {
    assert_eq!(wire(Value::Undefined), b"0:\"$undefined\"\n");
    assert_eq!(wire(Value::from(f64::NAN)), b"0:\"$NaN\"\n");
    assert_eq!(wire(Value::from(f64::INFINITY)), b"0:\"$Infinity\"\n");
    assert_eq!(wire(Value::from(f64::NEG_INFINITY)), b"0:\"$-Infinity\"\n");
    assert_eq!(wire(Value::from(-0.0)), b"0:\"$-0\"\n");
    assert_eq!(wire(Value::from(0.0)), b"0:0\n");
    assert_eq!(wire(Value::from(10i128)), b"0:\"$n10\"\n");

    assert!(transit(Value::Undefined).is_undefined());
    assert!(transit(Value::from(f64::NAN)).is_nan());
    assert_eq!(
        transit(Value::from(f64::NEG_INFINITY)).as_f64(),
        Some(f64::NEG_INFINITY)
    );
    assert!(transit(Value::from(-0.0)).is_negative_zero());
    assert!(!transit(Value::from(0.0)).is_negative_zero());
    assert_eq!(transit(Value::from(-7i128)), Value::from(-7i128));

    // Tokens nest anywhere a value can.
    assert_eq!(
        wire(Value::object([("u", Value::Undefined)])),
        b"0:{\"u\":\"$undefined\"}\n"
    );
}

/// Dates carry their ISO text verbatim, no reformatting on either side.
#[test]
fn dates_round_trip_verbatim() {
    let date = Value::Date("2026-02-14T09:30:00.000Z".into());
    assert_eq!(
        wire(date.clone()),
        b"0:\"$D2026-02-14T09:30:00.000Z\"\n"
    );
    assert_eq!(transit(date.clone()), date);
}

/// Symbols / Validate by-name interning through the import queue.
#[test]
fn symbols_dedup_through_the_import_queue() {
    let first = Value::Symbol("answer".into());
    let second = Value::Symbol("answer".into());
    assert_eq!(
        wire(Value::array([first, second])),
        b"1:\"$Sanswer\"\n0:[\"$1\",\"$1\"]\n"
    );

    let back = transit(Value::array([
        Value::Symbol("answer".into()),
        Value::Symbol("other".into()),
    ]));
    let items = back.as_array().expect("array root").snapshot();
    assert_eq!(items[0], Value::Symbol("answer".into()));
    assert_eq!(items[1], Value::Symbol("other".into()));
}

/// User text starting with `$` must never read as a token.
#[test]
fn dollar_strings_are_escaped_not_interpreted() {
    assert_eq!(wire(Value::from("$foo")), b"0:\"$$foo\"\n");
    assert_eq!(transit(Value::from("$foo")), Value::from("$foo"));
    assert_eq!(transit(Value::from("$")), Value::from("$"));
    assert_eq!(transit(Value::from("$$double")), Value::from("$$double"));

    let root = Value::object([("a", Value::from(1)), ("b", Value::from("$x"))]);
    assert_eq!(wire(root.clone()), b"0:{\"a\":1,\"b\":\"$$x\"}\n");
    assert_eq!(transit(root.clone()), root);
}

/// Whole doubles inside the exact-integer range print without a fraction.
#[test]
fn integers_keep_integer_form_on_the_wire() {
    assert_eq!(
        wire(Value::from(9_007_199_254_740_992.0)),
        b"0:9007199254740992\n"
    );
    assert_eq!(wire(Value::from(-3)), b"0:-3\n");
    assert_eq!(wire(Value::from(2.5)), b"0:2.5\n");
    assert_eq!(wire(Value::from(1e21)), b"0:1e21\n");
    assert_eq!(transit(Value::from(1e21)), Value::from(1e21));
}

/// Large text / Validate the length-prefixed text row and its threshold.
#[test]
fn long_strings_outline_into_text_rows() {
    let text = "x".repeat(2000);
    let mut expected = Vec::new();
    expected.extend_from_slice(b"1:T7d0,");
    expected.extend_from_slice(text.as_bytes());
    expected.extend_from_slice(b"0:\"$1\"\n");
    assert_eq!(wire(Value::from(text.clone())), expected);
    assert_eq!(transit(Value::from(text.clone())), Value::from(text));

    // Exactly at the threshold stays inline.
    let boundary = "y".repeat(1024);
    assert_eq!(
        wire(Value::from(boundary.clone())),
        format!("0:\"{boundary}\"\n").into_bytes()
    );
}

/// Typed binary / Validate the kind tag, the byte frame, and alignment.
#[test]
fn binary_values_keep_kind_and_bytes() {
    let data: Vec<u8> = (0..8).collect();
    let binary = Binary::new(BinaryKind::U32, data.clone()).expect("aligned payload");

    let mut expected = Vec::new();
    expected.extend_from_slice(b"1:l8,");
    expected.extend_from_slice(&data);
    expected.extend_from_slice(b"0:\"$1\"\n");
    assert_eq!(wire(Value::from(binary.clone())), expected);

    let back = transit(Value::from(binary));
    let Value::Binary(decoded) = back else {
        panic!("expected binary, got {back:?}");
    };
    assert_eq!(decoded.kind(), BinaryKind::U32);
    assert_eq!(decoded.data(), data.as_slice());
    assert_eq!(decoded.element_count(), 2);

    // Five bytes cannot be whole 4-byte elements.
    assert!(Binary::new(BinaryKind::U32, vec![0; 5]).is_err());
}

/// Blobs split into a bytes row and a descriptor row naming the media type.
#[test]
fn blobs_round_trip_with_their_mime_type() {
    let blob = Value::Blob(Arc::new(BlobValue {
        mime: "text/plain".into(),
        data: b"hello".to_vec(),
    }));

    let mut expected = Vec::new();
    expected.extend_from_slice(b"1:A5,hello");
    expected.extend_from_slice(b"2:[\"text/plain\",\"$1\"]\n");
    expected.extend_from_slice(b"0:\"$B2\"\n");
    assert_eq!(wire(blob.clone()), expected);

    let back = transit(blob);
    let Value::Blob(decoded) = back else {
        panic!("expected blob, got {back:?}");
    };
    assert_eq!(decoded.mime, "text/plain");
    assert_eq!(decoded.data, b"hello");
}

/// Maps / Validate the entry-list row, shaped reference, and key order.
#[test]
fn maps_travel_as_outlined_entry_rows() {
    let map = Value::map([(Value::from("k"), Value::from(1))]);
    assert_eq!(wire(map), b"1:[[\"k\",1]]\n0:\"$Q1\"\n");

    let back = transit(Value::map([
        (Value::from("k"), Value::from(1)),
        (Value::from(2), Value::from("even")),
    ]));
    let Value::Map(entries) = back else {
        panic!("expected map, got {back:?}");
    };
    let entries = entries.snapshot();
    assert_eq!(entries[0], (Value::from("k"), Value::from(1)));
    assert_eq!(entries[1], (Value::from(2), Value::from("even")));
}

/// Sets / Validate the element-list row and shaped reference.
#[test]
fn sets_travel_as_outlined_element_rows() {
    let set = Value::set([Value::from(1), Value::from(2)]);
    assert_eq!(wire(set), b"1:[1,2]\n0:\"$W1\"\n");

    let back = transit(Value::set([Value::from("only")]));
    let Value::Set(items) = back else {
        panic!("expected set, got {back:?}");
    };
    assert_eq!(items.snapshot(), vec![Value::from("only")]);
}

/// Form payloads travelling as values keep entry order and byte metadata.
#[test]
fn form_payload_values_round_trip() {
    let mut form = FormPayload::new();
    form.append("note", FormEntry::Text("hello".into()));
    form.append("raw", FormEntry::Bytes(vec![1, 2, 3], None));
    form.append(
        "pic",
        FormEntry::Bytes(vec![9, 9], Some("image/png".into())),
    );

    let back = transit(Value::Form(Arc::new(form.clone())));
    let Value::Form(decoded) = back else {
        panic!("expected form payload, got {back:?}");
    };
    assert_eq!(decoded.len(), 3);
    assert_eq!(
        decoded.get("note"),
        Some(&FormEntry::Text("hello".into()))
    );
    assert_eq!(
        decoded.get("raw"),
        Some(&FormEntry::Bytes(vec![1, 2, 3], None))
    );
    assert_eq!(
        decoded.get("pic"),
        Some(&FormEntry::Bytes(vec![9, 9], Some("image/png".into())))
    );
}

/// Error payloads / Validate redaction by default and full text in debug.
#[test]
fn error_values_redact_messages_unless_debug() {
    let error = ErrorValue::new("case-9 failed").with_digest("case-9");

    let bytes = wire(Value::from(error.clone()));
    assert_eq!(bytes, b"1:{\"digest\":\"case-9\"}\n0:\"$Z1\"\n");

    let back = Rowcode::decode_from_slice(&bytes).expect("decode failed");
    let Value::Error(decoded) = back else {
        panic!("expected error value, got {back:?}");
    };
    assert_eq!(decoded.digest.as_deref(), Some("case-9"));
    assert!(decoded.message.contains("omitted"));
    assert_ne!(decoded.message, "case-9 failed");

    let debug_bytes = Rowcode::encode_to_vec_with(
        Value::from(error.with_stack("at handler (svc.rs:9)")),
        EncodeOptions {
            debug: true,
            ..Default::default()
        },
    )
    .expect("encode failed");
    assert_eq!(
        debug_bytes,
        b"1:{\"digest\":\"case-9\",\"message\":\"case-9 failed\",\"stack\":\"at handler (svc.rs:9)\"}\n0:\"$Z1\"\n"
    );

    let back = Rowcode::decode_from_slice(&debug_bytes).expect("decode failed");
    let Value::Error(decoded) = back else {
        panic!("expected error value, got {back:?}");
    };
    assert_eq!(decoded.message, "case-9 failed");
    assert_eq!(decoded.stack.as_deref(), Some("at handler (svc.rs:9)"));
}
