//! One-call entry points.
//!
//! [`Rowcode`] wraps the session types for the common case where the whole
//! graph is available up front and the caller wants bytes (or form fields)
//! in hand before moving on. Anything incremental, from backpressure to
//! values that settle late, goes through [`Request`] and [`Response`]
//! directly.

use crate::decode::{ChunkRead, DecodeOptions, Response};
use crate::encode::{encode_form_fields, EncodeOptions, Progress, Request};
use crate::error::{Result, RowcodeError};
use crate::io::VecSink;
use crate::value::{FormPayload, Value};

/// Whole-value encoding and decoding in a single call.
#[derive(Debug)]
pub struct Rowcode;

impl Rowcode {
    /// Encodes a value graph into wire bytes.
    ///
    /// Every deferred and stream in the graph must already be settled, or
    /// be settled synchronously by a source this thread can observe;
    /// otherwise the call fails with [`RowcodeError::Deadlock`] rather
    /// than wait forever.
    pub fn encode_to_vec(root: Value) -> Result<Vec<u8>> {
        Self::encode_to_vec_with(root, EncodeOptions::default())
    }

    /// [`Rowcode::encode_to_vec`] with explicit options.
    pub fn encode_to_vec_with(root: Value, options: EncodeOptions) -> Result<Vec<u8>> {
        let mut request = Request::new(root, options);
        let mut sink = VecSink::new();
        loop {
            match request.poll(&mut sink)? {
                Progress::Complete => return Ok(sink.into_bytes()),
                Progress::SinkFull => {}
                Progress::AwaitingValues => {
                    if !request.has_pending_wakeups() {
                        return Err(RowcodeError::Deadlock(
                            "the value graph waits on sources that will never settle".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Decodes one complete wire payload back into a value graph.
    pub fn decode_from_slice(bytes: &[u8]) -> Result<Value> {
        Self::decode_from_slice_with(bytes, DecodeOptions::default())
    }

    /// [`Rowcode::decode_from_slice`] with explicit options.
    pub fn decode_from_slice_with(bytes: &[u8], options: DecodeOptions) -> Result<Value> {
        let mut response = Response::new(options);
        response.push(bytes)?;
        response.close();
        match response.read_root() {
            ChunkRead::Ready(value) => Ok(value),
            ChunkRead::Failed(error) => Err(RowcodeError::Serialization(error.message.clone())),
            ChunkRead::Pending => Err(RowcodeError::Format(
                "the payload ended before the root row resolved".into(),
            )),
        }
    }

    /// Encodes a value graph into named form fields.
    pub fn encode_to_form_fields(root: Value) -> Result<FormPayload> {
        Self::encode_to_form_fields_with(root, EncodeOptions::default())
    }

    /// [`Rowcode::encode_to_form_fields`] with explicit options.
    pub fn encode_to_form_fields_with(root: Value, options: EncodeOptions) -> Result<FormPayload> {
        encode_form_fields(root, options)
    }

    /// Decodes a form-field payload back into a value graph.
    pub fn decode_from_form_fields(fields: &FormPayload) -> Result<Value> {
        Self::decode_from_form_fields_with(fields, DecodeOptions::default())
    }

    /// [`Rowcode::decode_from_form_fields`] with explicit options.
    pub fn decode_from_form_fields_with(
        fields: &FormPayload,
        options: DecodeOptions,
    ) -> Result<Value> {
        crate::decode::decode_form_fields(fields, options)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn a_settled_graph_encodes_in_one_call() {
        let root = Value::object([
            ("name", Value::from("ada")),
            ("tags", Value::array([Value::from("a"), Value::from("b")])),
        ]);
        let bytes = Rowcode::encode_to_vec(root).unwrap();
        assert_eq!(bytes, b"0:{\"name\":\"ada\",\"tags\":[\"a\",\"b\"]}\n");
    }

    #[test]
    fn an_unsettled_graph_is_a_deadlock_not_a_hang() {
        let root = Value::array([Value::Deferred(crate::rt::DeferredValue::new())]);
        let err = Rowcode::encode_to_vec(root).unwrap_err();
        assert!(matches!(err, RowcodeError::Deadlock(_)));
    }

    #[test]
    fn a_missing_root_row_reports_the_closed_session() {
        let err = Rowcode::decode_from_slice(b"1:\"only a side row\"\n").unwrap_err();
        assert!(matches!(err, RowcodeError::Serialization(_)));
    }

    #[test]
    fn a_dangling_reference_in_the_root_fails_to_decode() {
        let err = Rowcode::decode_from_slice(b"0:[\"$5\"]\n").unwrap_err();
        assert!(matches!(err, RowcodeError::Format(_)));
    }
}
