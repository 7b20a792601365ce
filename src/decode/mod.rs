//! Consuming a session: rows in, values out.
//!
//! The decode side mirrors the encoder's outline graph with a graph of
//! chunk cells, one per row id. Rows resolve cells; references between
//! rows become edges; [`Response::read`] surfaces a cell's state without
//! blocking. Payload parsing is lazy: a model row that nothing reads is
//! never JSON-parsed at all.
//!
//! Two entry transports feed the same machinery: the byte stream
//! ([`Response::push`]) and named form fields (see
//! [`Rowcode::decode_from_form_fields`]).
//!
//! [`Rowcode::decode_from_form_fields`]: crate::Rowcode::decode_from_form_fields

mod chunk;
mod form;
mod response;
mod reviver;

pub use chunk::ChunkRead;
pub use response::{DecodeOptions, Response};

pub(crate) use form::decode_form_fields;
