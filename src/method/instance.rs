//! Decoded method instances.

use bytes::Bytes;

use super::field::{FieldTable, FieldValue};
use super::types::{MethodKind, MethodType};
use crate::error::EncodeError;

/// A method with argument values matching its schema.
///
/// Construction validates field count and types, so an instance in hand is
/// always encodable.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInstance {
    method: &'static MethodType,
    fields: Vec<FieldValue>,
}

impl MethodInstance {
    /// Build an instance, checking `fields` against the schema of `kind`.
    pub fn new(kind: MethodKind, fields: Vec<FieldValue>) -> Result<Self, EncodeError> {
        let method = kind.descriptor();
        if fields.len() != method.fields.len() {
            return Err(EncodeError::FieldCount {
                method: method.name,
                expected: method.fields.len(),
                actual: fields.len(),
            });
        }
        for (spec, value) in method.fields.iter().zip(&fields) {
            if value.field_type() != spec.field_type {
                return Err(EncodeError::FieldType {
                    method: method.name,
                    field: spec.name,
                    expected: spec.field_type.name(),
                });
            }
        }
        Ok(Self { method, fields })
    }

    /// Schema already checked by the caller (decoder, typed constructors).
    pub(crate) fn from_parts(method: &'static MethodType, fields: Vec<FieldValue>) -> Self {
        debug_assert_eq!(method.fields.len(), fields.len());
        Self { method, fields }
    }

    #[inline]
    pub fn kind(&self) -> MethodKind {
        self.method.kind
    }

    #[inline]
    pub fn method(&self) -> &'static MethodType {
        self.method
    }

    #[inline]
    pub fn class_id(&self) -> u16 {
        self.method.class_id()
    }

    #[inline]
    pub fn method_id(&self) -> u16 {
        self.method.method_id
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.method.field_index(name).map(|i| &self.fields[i])
    }

    pub fn bit(&self, name: &str) -> Option<bool> {
        match self.field(name)? {
            FieldValue::Bit(v) => Some(*v),
            _ => None,
        }
    }

    pub fn octet(&self, name: &str) -> Option<u8> {
        match self.field(name)? {
            FieldValue::Octet(v) => Some(*v),
            _ => None,
        }
    }

    pub fn short(&self, name: &str) -> Option<u16> {
        match self.field(name)? {
            FieldValue::Short(v) => Some(*v),
            _ => None,
        }
    }

    pub fn long(&self, name: &str) -> Option<u32> {
        match self.field(name)? {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn short_str(&self, name: &str) -> Option<&str> {
        match self.field(name)? {
            FieldValue::ShortStr(v) => Some(v),
            _ => None,
        }
    }

    pub fn long_str(&self, name: &str) -> Option<&Bytes> {
        match self.field(name)? {
            FieldValue::LongStr(v) => Some(v),
            _ => None,
        }
    }

    pub fn table(&self, name: &str) -> Option<&FieldTable> {
        match self.field(name)? {
            FieldValue::Table(v) => Some(v),
            _ => None,
        }
    }

    // Typed constructors for the methods the gateway itself sends.

    pub fn connection_start(
        server_properties: FieldTable,
        mechanisms: &str,
        locales: &str,
    ) -> Self {
        Self::from_parts(
            MethodKind::ConnectionStart.descriptor(),
            vec![
                FieldValue::Octet(0),
                FieldValue::Octet(9),
                FieldValue::Table(server_properties),
                FieldValue::LongStr(Bytes::copy_from_slice(mechanisms.as_bytes())),
                FieldValue::LongStr(Bytes::copy_from_slice(locales.as_bytes())),
            ],
        )
    }

    pub fn connection_start_ok(
        client_properties: FieldTable,
        mechanism: &str,
        response: Bytes,
        locale: &str,
    ) -> Self {
        Self::from_parts(
            MethodKind::ConnectionStartOk.descriptor(),
            vec![
                FieldValue::Table(client_properties),
                FieldValue::ShortStr(mechanism.to_owned()),
                FieldValue::LongStr(response),
                FieldValue::ShortStr(locale.to_owned()),
            ],
        )
    }

    pub fn connection_secure_ok(response: Bytes) -> Self {
        Self::from_parts(
            MethodKind::ConnectionSecureOk.descriptor(),
            vec![FieldValue::LongStr(response)],
        )
    }

    pub fn connection_tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Self {
        Self::tune_like(MethodKind::ConnectionTune, channel_max, frame_max, heartbeat)
    }

    pub fn connection_tune_ok(channel_max: u16, frame_max: u32, heartbeat: u16) -> Self {
        Self::tune_like(MethodKind::ConnectionTuneOk, channel_max, frame_max, heartbeat)
    }

    fn tune_like(kind: MethodKind, channel_max: u16, frame_max: u32, heartbeat: u16) -> Self {
        Self::from_parts(
            kind.descriptor(),
            vec![
                FieldValue::Short(channel_max),
                FieldValue::Long(frame_max),
                FieldValue::Short(heartbeat),
            ],
        )
    }

    pub fn connection_open(virtual_host: &str) -> Self {
        Self::from_parts(
            MethodKind::ConnectionOpen.descriptor(),
            vec![
                FieldValue::ShortStr(virtual_host.to_owned()),
                FieldValue::ShortStr(String::new()),
                FieldValue::Bit(false),
            ],
        )
    }

    pub fn connection_open_ok() -> Self {
        Self::from_parts(
            MethodKind::ConnectionOpenOk.descriptor(),
            vec![FieldValue::ShortStr(String::new())],
        )
    }

    pub fn connection_close(reply_code: u16, reply_text: &str, failing: (u16, u16)) -> Self {
        Self::close_like(MethodKind::ConnectionClose, reply_code, reply_text, failing)
    }

    pub fn connection_close_ok() -> Self {
        Self::from_parts(MethodKind::ConnectionCloseOk.descriptor(), Vec::new())
    }

    pub fn channel_open() -> Self {
        Self::from_parts(
            MethodKind::ChannelOpen.descriptor(),
            vec![FieldValue::ShortStr(String::new())],
        )
    }

    pub fn channel_open_ok() -> Self {
        Self::from_parts(
            MethodKind::ChannelOpenOk.descriptor(),
            vec![FieldValue::LongStr(Bytes::new())],
        )
    }

    pub fn channel_flow(active: bool) -> Self {
        Self::from_parts(
            MethodKind::ChannelFlow.descriptor(),
            vec![FieldValue::Bit(active)],
        )
    }

    pub fn channel_close(reply_code: u16, reply_text: &str, failing: (u16, u16)) -> Self {
        Self::close_like(MethodKind::ChannelClose, reply_code, reply_text, failing)
    }

    pub fn channel_close_ok() -> Self {
        Self::from_parts(MethodKind::ChannelCloseOk.descriptor(), Vec::new())
    }

    fn close_like(kind: MethodKind, reply_code: u16, reply_text: &str, failing: (u16, u16)) -> Self {
        // reply-text is a shortstr; clip on a char boundary
        let mut end = reply_text.len().min(u8::MAX as usize);
        while !reply_text.is_char_boundary(end) {
            end -= 1;
        }
        Self::from_parts(
            kind.descriptor(),
            vec![
                FieldValue::Short(reply_code),
                FieldValue::ShortStr(reply_text[..end].to_owned()),
                FieldValue::Short(failing.0),
                FieldValue::Short(failing.1),
            ],
        )
    }
}
