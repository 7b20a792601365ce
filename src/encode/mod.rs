//! Turning value graphs into rows.
//!
//! Encoding is demand-driven. [`Request`] renders everything reachable
//! and already settled in one pass, queueing a row per outlined value,
//! and leaves a task behind for every deferred or stream still producing.
//! Each [`Request::poll`] picks up the sources that settled since last
//! time, renders them, and flushes the queues in priority order: imports
//! first, then hints, then models, then failures.
//!
//! The render walk lives in `serializer`; row framing and the form-field
//! transport live in `rows`.

mod request;
mod rows;
mod serializer;

pub use request::{EncodeOptions, Progress, Request, RequestStatus};

pub(crate) use request::encode_form_fields;
