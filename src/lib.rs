//! # Rowcode
//!
//! A streaming codec for rich value graphs, built for the case where the
//! receiver starts consuming before the sender has finished producing.
//!
//! ## Overview
//!
//! Rowcode is fundamentally different from whole-payload serializers.
//! Instead of emitting one monolithic document, it cuts a value graph into
//! independently addressed *rows* and writes them in the order they become
//! available. References between rows carry the graph structure, so the
//! payload can express cycles and aliasing, lean on values that have not
//! arrived yet, and keep flowing while slow parts of the graph settle.
//!
//! ### Key Features
//!
//! *   **Incremental Encoding:** Deferred values and streams serialize as
//!     references immediately; their rows follow whenever they settle.
//!     Nothing waits on the slowest part of the graph.
//! *   **Incremental Decoding:** Every row is usable the moment it arrives.
//!     Forward references resolve automatically once the missing rows land.
//! *   **Identity Preservation:** Values referenced from several places are
//!     written once and aliased, so decoded graphs keep their shape, cycles
//!     included.
//! *   **Rich Value Model:** Beyond JSON scalars: binary buffers, maps,
//!     sets, dates, big integers, blobs, form payloads, errors, symbols,
//!     and module references.
//! *   **Error Isolation:** A failure poisons the rows that depended on it
//!     and nothing else. The rest of the graph decodes normally.
//! *   **Backpressure:** The encoder hands rows to a sink one at a time and
//!     stops when the sink pushes back; the decoder accepts bytes at any
//!     granularity, mid-row included.
//! *   **Two Transports:** A newline-framed byte stream, and a form-field
//!     profile that spreads the same rows across named fields.
//!
//! ## Architecture
//!
//! ### The Row Stream
//!
//! A wire payload is a sequence of rows, each tagged with a hexadecimal id:
//!
//! ```text
//! 0:{"user":"$1","history":"$2"}
//! 1:{"name":"ada"}
//! 2:[["$1","first"],["$1","second"]]
//! ```
//!
//! Row zero is the root. `$1` and `$2` are references; the decoder patches
//! them as their rows resolve, in whatever order the rows arrive. Text
//! payloads are JSON; binary rows use a length-prefixed frame instead of a
//! newline terminator.
//!
//! ### Sessions
//!
//! Encoding and decoding are both modeled as long-lived sessions pumped by
//! the caller. [`Request`] renders the settled parts of the graph into
//! queued rows and flushes them on every [`Request::poll`]; sources that
//! settle between polls wake their tasks through an internal mailbox.
//! [`Response`] ingests bytes on [`Response::push`] and resolves chunk
//! cells that readers observe through [`Response::read`].
//!
//! Neither session owns a transport or a thread. Pairing them with a
//! socket, a channel, or an async runtime is the caller's choice.
//!
//! ## Core Concepts
//!
//! ### `Value`
//!
//! The dynamic value model. Containers are cheaply cloneable and share
//! storage, which is what makes identity observable: two clones of one
//! list encode as one row plus a reference. [`DeferredValue`] and
//! [`StreamValue`] are the asynchronous leaves.
//!
//! ### `Request`
//!
//! The encode session: a render walk over the graph, a task per value
//! still settling, and four priority queues feeding the sink. See the
//! [`encode`] module docs.
//!
//! ### `Response`
//!
//! The decode session: a row parser feeding a graph of chunk cells, with
//! lazy payload parsing and forward-reference bookkeeping. See the
//! [`decode`] module docs.
//!
//! ## Usage Patterns
//!
//! ### Whole-value round trip
//!
//! ```rust
//! use rowcode::{Rowcode, Value};
//!
//! let root = Value::object([
//!     ("answer", Value::from(42.0)),
//!     ("tags", Value::array([Value::from("a"), Value::from("b")])),
//! ]);
//!
//! let bytes = Rowcode::encode_to_vec(root)?;
//! let back = Rowcode::decode_from_slice(&bytes)?;
//! assert_eq!(back.get("answer").and_then(|v| v.as_f64()), Some(42.0));
//! # Ok::<(), rowcode::RowcodeError>(())
//! ```
//!
//! ### Incremental encoding
//!
//! ```rust,ignore
//! use rowcode::{DeferredValue, EncodeOptions, Progress, Request, Value};
//!
//! let slow = DeferredValue::new();
//! let root = Value::object([("report", Value::from(slow.clone()))]);
//! let mut request = Request::new(root, EncodeOptions::default());
//!
//! // First poll writes the root row with "$@1" where the report goes.
//! request.poll(&mut sink)?;
//!
//! // Later, when the report is ready, its row follows.
//! slow.fulfill(Value::from("all clear"));
//! assert_eq!(request.poll(&mut sink)?, Progress::Complete);
//! ```
//!
//! ### Streaming decode
//!
//! ```rust,ignore
//! use rowcode::{DecodeOptions, Response};
//!
//! let mut response = Response::new(DecodeOptions::default());
//! for frame in transport {
//!     response.push(&frame)?;
//!     if let Some(root) = response.read_root().ready() {
//!         println!("root resolved: {root:?}");
//!     }
//! }
//! response.close();
//! ```
//!
//! ### Safety and Error Handling
//!
//! *   **No Unsafe:** The crate contains no `unsafe` code (enforced by a
//!     crate-level lint).
//! *   **No Panics:** No `unwrap()` or `panic!()` in library code
//!     (enforced by clippy lints). Malformed input is an error, never a
//!     crash.
//! *   **Comprehensive Errors:** Every failure maps to a
//!     [`RowcodeError`] variant naming its failure domain.
//! *   **Poisoning:** Mutex poisoning in shared value storage is recovered,
//!     since every write is a single slot assignment.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// --- PUBLIC API MODULES ---
pub mod api;
pub mod decode;
pub mod encode;
pub mod error;
pub mod format;
pub mod io;
pub mod modules;
pub mod rt;
pub mod taint;
pub mod value;

// --- RE-EXPORTS ---

pub use api::Rowcode;
pub use decode::{ChunkRead, DecodeOptions, Response};
pub use encode::{EncodeOptions, Progress, Request, RequestStatus};
pub use error::{Result, RowcodeError};
pub use format::{BinaryKind, RowId};
pub use io::{IoSink, RowSink, VecSink, WriteFlow};
pub use modules::{
    ClientReference, ImportMetadata, ModuleLoader, ModuleManifest, ModuleMap, ServerReference,
    TemporaryReferenceSet,
};
pub use rt::{AbortSignal, DeferredState, DeferredValue, StreamKind, StreamPoll, StreamValue};
pub use taint::{TaintHandle, TaintRegistry};
pub use value::{
    Binary, BlobValue, ErrorKind, ErrorValue, FormEntry, FormPayload, SharedCell, SharedEntries,
    SharedList, SharedRecord, Value, ValueId,
};
