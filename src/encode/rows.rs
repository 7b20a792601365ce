//! Produced rows and the transports that carry them.
//!
//! The serializer and the task scheduler speak in [`WireRow`]s; a
//! [`RowConsumer`] turns them into an actual transport. The byte-stream
//! consumer renders the row framing into a [`RowSink`]; the form consumer
//! turns each row into a named form field instead.

use std::sync::Arc;

use crate::error::Result;
use crate::format::{self, RowId};
use crate::io::{RowSink, WriteFlow};
use crate::value::{FormEntry, FormPayload};

/// One row queued for delivery.
#[derive(Debug, Clone)]
pub(crate) struct WireRow {
    pub(crate) id: RowId,
    pub(crate) body: RowBody,
}

/// Row payload, still in structured form.
#[derive(Debug, Clone)]
pub(crate) enum RowBody {
    /// Untagged model JSON.
    Model(String),
    /// A newline-delimited tagged row; the payload may be empty.
    Tagged { tag: u8, text: String },
    /// A length-delimited UTF-8 text row (`T`).
    Text(String),
    /// A length-delimited binary row.
    Binary { tag: u8, data: Arc<[u8]> },
    /// An id-less hint frame.
    Hint { code: u8, json: String },
}

/// Where flushed rows go.
///
/// `consume` may report [`WriteFlow::Full`]; the row it was given is
/// considered delivered either way, and the flush stops afterwards.
pub(crate) trait RowConsumer {
    fn consume(&mut self, row: &WireRow) -> Result<WriteFlow>;
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

// --- BYTE-STREAM TRANSPORT ---

/// Renders rows into the wire byte framing.
pub(crate) struct SinkConsumer<'a> {
    sink: &'a mut dyn RowSink,
    scratch: Vec<u8>,
}

impl<'a> SinkConsumer<'a> {
    pub(crate) fn new(sink: &'a mut dyn RowSink) -> Self {
        Self {
            sink,
            scratch: Vec::new(),
        }
    }
}

impl RowConsumer for SinkConsumer<'_> {
    fn consume(&mut self, row: &WireRow) -> Result<WriteFlow> {
        self.scratch.clear();
        match &row.body {
            RowBody::Model(model) => {
                format::write_text_row(&mut self.scratch, row.id, None, model);
            }
            RowBody::Tagged { tag, text } => {
                format::write_text_row(&mut self.scratch, row.id, Some(*tag), text);
            }
            RowBody::Text(text) => {
                format::write_length_row(&mut self.scratch, row.id, format::tag::TEXT, text.as_bytes());
            }
            RowBody::Binary { tag, data } => {
                format::write_length_row(&mut self.scratch, row.id, *tag, data);
            }
            RowBody::Hint { code, json } => {
                format::write_hint_row(&mut self.scratch, *code, json);
            }
        }
        self.sink.write_row(&self.scratch)
    }

    fn finish(&mut self) -> Result<()> {
        self.sink.close()
    }
}

// --- FORM TRANSPORT ---

/// Renders rows into named form fields.
///
/// Field names are `<prefix><hex id>`. Tagged text rows keep their tag as
/// the first payload character; binary rows carry the tag in the entry
/// metadata instead. Hints have no addressable field and are dropped.
pub(crate) struct FormConsumer {
    prefix: String,
    fields: FormPayload,
}

impl FormConsumer {
    pub(crate) fn new(prefix: String) -> Self {
        Self {
            prefix,
            fields: FormPayload::new(),
        }
    }

    pub(crate) fn into_fields(self) -> FormPayload {
        self.fields
    }

    fn field_name(&self, id: RowId) -> String {
        format!("{}{}", self.prefix, id.to_hex())
    }
}

impl RowConsumer for FormConsumer {
    fn consume(&mut self, row: &WireRow) -> Result<WriteFlow> {
        match &row.body {
            RowBody::Model(model) => {
                self.fields
                    .append(self.field_name(row.id), FormEntry::Text(model.clone()));
            }
            RowBody::Tagged { tag, text } => {
                let mut payload = String::with_capacity(text.len() + 1);
                payload.push(char::from(*tag));
                payload.push_str(text);
                self.fields
                    .append(self.field_name(row.id), FormEntry::Text(payload));
            }
            RowBody::Text(text) => {
                let mut payload = String::with_capacity(text.len() + 1);
                payload.push(char::from(format::tag::TEXT));
                payload.push_str(text);
                self.fields
                    .append(self.field_name(row.id), FormEntry::Text(payload));
            }
            RowBody::Binary { tag, data } => {
                self.fields.append(
                    self.field_name(row.id),
                    FormEntry::Bytes(data.to_vec(), Some(char::from(*tag).to_string())),
                );
            }
            RowBody::Hint { .. } => {}
        }
        Ok(WriteFlow::Ready)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::io::VecSink;

    #[test]
    fn sink_consumer_frames_each_body_kind() {
        let mut sink = VecSink::new();
        let mut consumer = SinkConsumer::new(&mut sink);
        consumer
            .consume(&WireRow {
                id: RowId(0),
                body: RowBody::Model("{\"a\":1}".into()),
            })
            .unwrap();
        consumer
            .consume(&WireRow {
                id: RowId(1),
                body: RowBody::Tagged {
                    tag: b'C',
                    text: String::new(),
                },
            })
            .unwrap();
        consumer
            .consume(&WireRow {
                id: RowId(2),
                body: RowBody::Binary {
                    tag: b'o',
                    data: Arc::from(&[9u8, 8][..]),
                },
            })
            .unwrap();
        assert_eq!(sink.bytes(), b"0:{\"a\":1}\n1:C\n2:o2,\x09\x08");
    }

    #[test]
    fn form_consumer_prefixes_tags_and_drops_hints() {
        let mut consumer = FormConsumer::new("f_".into());
        consumer
            .consume(&WireRow {
                id: RowId(0),
                body: RowBody::Model("\"hello\"".into()),
            })
            .unwrap();
        consumer
            .consume(&WireRow {
                id: RowId(3),
                body: RowBody::Tagged {
                    tag: b'E',
                    text: "{\"digest\":\"d\"}".into(),
                },
            })
            .unwrap();
        consumer
            .consume(&WireRow {
                id: RowId(0),
                body: RowBody::Hint {
                    code: b'L',
                    json: "[]".into(),
                },
            })
            .unwrap();
        let fields = consumer.into_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("f_0"), Some(&FormEntry::Text("\"hello\"".into())));
        assert_eq!(
            fields.get("f_3"),
            Some(&FormEntry::Text("E{\"digest\":\"d\"}".into()))
        );
    }
}
