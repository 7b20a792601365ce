#![allow(missing_docs)]

use std::sync::{Arc, Mutex};

use rowcode::{
    ChunkRead, ClientReference, DecodeOptions, DeferredState, DeferredValue, EncodeOptions,
    ImportMetadata, ModuleLoader, ModuleMap, Progress, Request, Response, Result, RowId, Rowcode,
    ServerReference, TemporaryReferenceSet, Value, VecSink,
};

// --- MOCK DATA STRUCTURES ---

/// Host loader that resolves every import to a marker string, recording
/// which modules were preloaded and optionally gating them behind one
/// shared deferred.
struct StaticLoader {
    preloads: Mutex<Vec<String>>,
    gate: Option<DeferredValue>,
}

impl StaticLoader {
    fn new() -> Self {
        Self {
            preloads: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn gated(gate: DeferredValue) -> Self {
        Self {
            preloads: Mutex::new(Vec::new()),
            gate: Some(gate),
        }
    }
}

impl ModuleLoader for StaticLoader {
    fn preload(&self, metadata: &ImportMetadata) -> Option<DeferredValue> {
        self.preloads
            .lock()
            .expect("lock")
            .push(metadata.module_id.clone());
        self.gate.clone()
    }

    fn require(&self, metadata: &ImportMetadata) -> Result<Value> {
        Ok(Value::from(format!(
            "module:{}#{}",
            metadata.module_id, metadata.export_name
        )))
    }
}

// --- HELPERS ---

fn open() -> Response {
    Response::new(DecodeOptions::default())
}

fn button_manifest() -> ModuleMap {
    let mut manifest = ModuleMap::new();
    manifest.insert(
        "src/button.js#default",
        ImportMetadata::new("./button.js", vec!["chunk-btn".into()], "default"),
    );
    manifest
}

fn encode_with_manifest(root: Value) -> Vec<u8> {
    let options = EncodeOptions {
        manifest: Some(Arc::new(button_manifest())),
        ..Default::default()
    };
    Rowcode::encode_to_vec_with(root, options).expect("encode failed")
}

// --- TESTS ---

/// Client references / Validate the import row and key-based dedup.
#[test]
fn client_references_write_import_rows() {
    let first = Value::ClientRef(Arc::new(ClientReference::new("src/button.js#default")));
    let second = Value::ClientRef(Arc::new(ClientReference::new("src/button.js#default")));
    let bytes = encode_with_manifest(Value::array([first, second]));

    // Two distinct reference values, one key: one import row, flushed
    // ahead of the model that uses it.
    assert_eq!(
        bytes,
        b"1:I[\"./button.js\",[\"chunk-btn\"],\"default\"]\n0:[\"$1\",\"$1\"]\n"
    );
}

/// Loaded imports / Validate that every position gets the loaded export.
#[test]
fn imports_resolve_through_the_loader() {
    let first = Value::ClientRef(Arc::new(ClientReference::new("src/button.js#default")));
    let second = Value::ClientRef(Arc::new(ClientReference::new("src/button.js#default")));
    let bytes = encode_with_manifest(Value::array([first, second]));

    let loader = Arc::new(StaticLoader::new());
    let mut response = Response::new(DecodeOptions {
        loader: Some(Arc::clone(&loader) as Arc<dyn ModuleLoader + Send + Sync>),
        ..Default::default()
    });
    response.push(&bytes).expect("push");

    let ChunkRead::Ready(back) = response.read_root() else {
        panic!("root should resolve once the loader answers");
    };
    let marker = Value::from("module:./button.js#default");
    assert_eq!(back.index(0), Some(marker.clone()));
    assert_eq!(back.index(1), Some(marker));

    // One import row, one preload, however many positions use it.
    assert_eq!(
        *loader.preloads.lock().expect("lock"),
        vec!["./button.js".to_owned()]
    );
}

/// Async modules / Validate that reads stay pending until the preload settles.
#[test]
fn async_preloads_gate_module_resolution() {
    let root = Value::ClientRef(Arc::new(ClientReference::new("src/button.js#default")));
    let bytes = encode_with_manifest(root);

    let gate = DeferredValue::new();
    let loader = Arc::new(StaticLoader::gated(gate.clone()));
    let mut response = Response::new(DecodeOptions {
        loader: Some(loader),
        ..Default::default()
    });
    response.push(&bytes).expect("push");

    assert!(response.read_root().is_pending());
    assert!(response.read_root().is_pending());

    assert!(gate.fulfill(Value::Null));
    let ChunkRead::Ready(back) = response.read_root() else {
        panic!("root should resolve after the preload settles");
    };
    assert_eq!(back, Value::from("module:./button.js#default"));
}

/// A key the manifest does not know fails its own position, nothing else.
#[test]
fn missing_manifest_entries_fail_only_that_position() {
    let root = Value::object([
        (
            "widget",
            Value::ClientRef(Arc::new(ClientReference::new("src/gone.js#default"))),
        ),
        ("note", Value::from("still here")),
    ]);
    let bytes = Rowcode::encode_to_vec_with(
        root,
        EncodeOptions {
            manifest: Some(Arc::new(button_manifest())),
            debug: true,
            ..Default::default()
        },
    )
    .expect("a missing manifest entry is recoverable");

    let mut response = open();
    response.push(&bytes).expect("push");

    let ChunkRead::Ready(back) = response.read_root() else {
        panic!("root should survive a missing manifest entry");
    };
    assert_eq!(back.get("note"), Some(Value::from("still here")));

    let Some(Value::Deferred(site)) = back.get("widget") else {
        panic!("the broken position should decode as a deferred");
    };
    let DeferredState::Rejected(error) = site.state() else {
        panic!("the broken position should reject");
    };
    assert!(error.message.contains("Could not find the module"));
    assert!(error.message.contains("src/gone.js#default"));
}

/// Import rows without a configured loader reject the rows that need them.
#[test]
fn no_loader_rejects_import_rows() {
    let mut response = open();
    response
        .push(b"1:I[\"./button.js\",[\"chunk-btn\"],\"default\"]\n0:\"$1\"\n")
        .expect("push");

    let ChunkRead::Failed(error) = response.read_root() else {
        panic!("imports need a loader to resolve");
    };
    assert!(error.message.contains("no module loader"));
}

/// Server references / Validate key and bound arguments across the wire.
#[test]
fn server_references_round_trip_with_bound_args() {
    let root = Value::ServerRef(Arc::new(
        ServerReference::new("act-42").with_bound(Value::array([Value::from(7)])),
    ));
    let bytes = Rowcode::encode_to_vec(root).expect("encode failed");
    assert_eq!(bytes, b"1:{\"id\":\"act-42\",\"bound\":[7]}\n0:\"$F1\"\n");

    let Value::ServerRef(back) = Rowcode::decode_from_slice(&bytes).expect("decode failed") else {
        panic!("the root should decode as a server reference");
    };
    assert_eq!(back.key(), "act-42");
    let bound = Value::array([Value::from(7)]);
    assert_eq!(back.bound(), Some(&bound));
}

/// Temporary references / Validate the value never reaches the wire.
#[test]
fn temporary_references_never_cross_the_wire() {
    let secret = Value::object([("token", Value::from("super-secret"))]);
    let refs = TemporaryReferenceSet::new();
    refs.add(&secret).expect("objects carry an identity");

    let bytes = Rowcode::encode_to_vec_with(
        Value::array([secret.clone(), Value::from("public")]),
        EncodeOptions {
            temporary_references: Some(refs.clone()),
            ..Default::default()
        },
    )
    .expect("encode failed");

    assert_eq!(bytes, b"0:[\"$T0\",\"public\"]\n");
    let text = String::from_utf8(bytes.clone()).expect("utf8");
    assert!(!text.contains("super-secret"));

    // Decoding with the same set hands back the original storage.
    let back = Rowcode::decode_from_slice_with(
        &bytes,
        DecodeOptions {
            temporary_references: Some(refs),
            ..Default::default()
        },
    )
    .expect("decode failed");
    let restored = back.index(0).expect("first element");
    assert!(Value::ptr_eq(&restored, &secret));
    assert_eq!(back.index(1), Some(Value::from("public")));

    // Without the set the key is meaningless.
    let missing = Rowcode::decode_from_slice(&bytes).expect_err("the key alone is useless");
    assert!(missing.to_string().contains("temporary reference"));
}

/// Hints / Validate the id-less row and the decode-side callback.
#[test]
fn hints_deliver_code_and_payload() {
    let mut request = Request::new(Value::from("body"), EncodeOptions::default());
    request
        .hint(
            b'L',
            &Value::object([
                ("href", Value::from("/app.css")),
                ("as", Value::from("style")),
            ]),
        )
        .expect("hint");
    let mut sink = VecSink::new();
    assert_eq!(request.poll(&mut sink).expect("poll"), Progress::Complete);
    let bytes = sink.into_bytes();
    assert_eq!(
        bytes,
        b":HL{\"href\":\"/app.css\",\"as\":\"style\"}\n0:\"body\"\n"
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = Arc::clone(&seen);
    let mut response = Response::new(DecodeOptions {
        on_hint: Some(Box::new(move |code, value| {
            hook_seen.lock().expect("lock").push((code, value));
        })),
        ..Default::default()
    });
    response.push(&bytes).expect("push");

    let ChunkRead::Ready(root) = response.read_root() else {
        panic!("root should be ready");
    };
    assert_eq!(root, Value::from("body"));

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    let (code, payload) = &seen[0];
    assert_eq!(*code, b'L');
    assert_eq!(payload.get("href"), Some(Value::from("/app.css")));
    assert_eq!(payload.get("as"), Some(Value::from("style")));
}

/// Debug info rows attach to their target without disturbing its value.
#[test]
fn debug_rows_attach_to_their_chunk() {
    let mut response = open();
    response
        .push(b"0:\"hello\"\n0:D{\"time\":12}\n")
        .expect("push");

    let ChunkRead::Ready(root) = response.read_root() else {
        panic!("root should be ready");
    };
    assert_eq!(root, Value::from("hello"));

    let info = response.debug_info(RowId(0)).expect("debug info attached");
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].get("time"), Some(Value::from(12)));
}

/// Console replay rows are side effects only; decoding proceeds untouched.
#[test]
fn console_rows_replay_without_error() {
    let mut response = open();
    response
        .push(b"0:\"ok\"\n5:W[\"warn\",\"careful\"]\n")
        .expect("push");

    let ChunkRead::Ready(root) = response.read_root() else {
        panic!("root should be ready");
    };
    assert_eq!(root, Value::from("ok"));
}
