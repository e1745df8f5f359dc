//! Method registry: `(class_id, method_id)` to descriptor, plus payload codec.
//!
//! The registry is closed once built. Registering the same id pair twice is a
//! startup error, never a silent overwrite.
//!
//! # Example
//!
//! ```
//! use amqp_gateway::method::{MethodInstance, MethodRegistry};
//!
//! let registry = MethodRegistry::standard();
//! let open = MethodInstance::connection_open("/vhostA");
//!
//! let payload = registry.encode(&open).unwrap();
//! let decoded = registry.decode_payload(&payload).unwrap();
//! assert_eq!(decoded, open);
//! ```

use std::collections::{HashMap, HashSet};

use bytes::{BufMut, Bytes, BytesMut};

use super::field::{put_long_str, put_short_str, put_table, FieldType, FieldValue, WireReader};
use super::instance::MethodInstance;
use super::types::{MethodKind, MethodType};
use crate::error::{DecodeError, EncodeError, RegistryError};
use crate::protocol::{Frame, FrameType};

/// Collects method descriptors before the registry is sealed.
#[derive(Debug, Default)]
pub struct MethodRegistryBuilder {
    methods: HashMap<(u16, u16), &'static MethodType>,
}

impl MethodRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one method type.
    pub fn register(mut self, method: &'static MethodType) -> Result<Self, RegistryError> {
        let (class_id, method_id) = method.ids();
        if self.methods.insert((class_id, method_id), method).is_some() {
            return Err(RegistryError::Duplicate {
                class_id,
                method_id,
            });
        }
        Ok(self)
    }

    /// Register every method of the given kinds.
    pub fn register_all(
        self,
        kinds: impl IntoIterator<Item = MethodKind>,
    ) -> Result<Self, RegistryError> {
        kinds
            .into_iter()
            .try_fold(self, |builder, kind| builder.register(kind.descriptor()))
    }

    pub fn build(self) -> MethodRegistry {
        let classes = self.methods.keys().map(|(class_id, _)| *class_id).collect();
        MethodRegistry {
            methods: self.methods,
            classes,
        }
    }
}

/// Sealed lookup table of supported methods.
#[derive(Debug, Clone)]
pub struct MethodRegistry {
    methods: HashMap<(u16, u16), &'static MethodType>,
    classes: HashSet<u16>,
}

impl MethodRegistry {
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder::new()
    }

    /// Registry holding every built-in connection and channel method.
    ///
    /// Goes through the builder, so a repeated id pair in [`MethodKind::ALL`]
    /// is reported as [`RegistryError::Duplicate`].
    pub fn try_standard() -> Result<Self, RegistryError> {
        Ok(MethodRegistryBuilder::new()
            .register_all(MethodKind::ALL)?
            .build())
    }

    /// Same as [`MethodRegistry::try_standard`].
    ///
    /// # Panics
    ///
    /// If two built-in methods share an id pair. The built-in table is fixed
    /// at compile time and checked by this module's tests.
    pub fn standard() -> Self {
        match Self::try_standard() {
            Ok(registry) => registry,
            Err(err) => panic!("built-in method table is inconsistent: {err}"),
        }
    }

    pub fn lookup(&self, class_id: u16, method_id: u16) -> Option<&'static MethodType> {
        self.methods.get(&(class_id, method_id)).copied()
    }

    /// Whether any method of this class is registered.
    pub fn has_class(&self, class_id: u16) -> bool {
        self.classes.contains(&class_id)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Encode a method payload: class id, method id, then the arguments.
    pub fn encode(&self, instance: &MethodInstance) -> Result<Bytes, EncodeError> {
        let method = instance.method();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(method.class_id());
        buf.put_u16(method.method_id);
        encode_fields(&mut buf, method, instance.fields())?;
        Ok(buf.freeze())
    }

    /// Encode a method straight into a method frame.
    pub fn encode_frame(&self, channel: u16, instance: &MethodInstance) -> Result<Frame, EncodeError> {
        Ok(Frame::new(FrameType::Method, channel, self.encode(instance)?))
    }

    /// Decode the arguments of a known method.
    ///
    /// All-or-nothing: any failure returns an error and no instance.
    pub fn decode(
        &self,
        class_id: u16,
        method_id: u16,
        args: &[u8],
    ) -> Result<MethodInstance, DecodeError> {
        let method = self
            .lookup(class_id, method_id)
            .ok_or(DecodeError::UnknownMethod {
                class_id,
                method_id,
            })?;
        let mut reader = WireReader::new(args);
        let fields = decode_fields(&mut reader, method)?;
        if reader.remaining() > 0 {
            return Err(DecodeError::TrailingBytes {
                method: method.name,
                remaining: reader.remaining(),
            });
        }
        Ok(MethodInstance::from_parts(method, fields))
    }

    /// Decode a full method payload including the id prefix.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<MethodInstance, DecodeError> {
        if payload.len() < 4 {
            return Err(DecodeError::PayloadTooShort);
        }
        let class_id = u16::from_be_bytes([payload[0], payload[1]]);
        let method_id = u16::from_be_bytes([payload[2], payload[3]]);
        self.decode(class_id, method_id, &payload[4..])
    }

    /// Decode a method frame. Non-method frames yield `None`.
    pub fn decode_frame(&self, frame: &Frame) -> Result<Option<MethodInstance>, DecodeError> {
        if frame.frame_type != FrameType::Method {
            return Ok(None);
        }
        self.decode_payload(&frame.payload).map(Some)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn encode_fields(
    buf: &mut BytesMut,
    method: &'static MethodType,
    fields: &[FieldValue],
) -> Result<(), EncodeError> {
    if fields.len() != method.fields.len() {
        return Err(EncodeError::FieldCount {
            method: method.name,
            expected: method.fields.len(),
            actual: fields.len(),
        });
    }

    // Consecutive bits share one octet, first bit in the low-order position.
    let mut bits: u8 = 0;
    let mut bit_count = 0u8;

    for (spec, value) in method.fields.iter().zip(fields) {
        if spec.field_type != FieldType::Bit && bit_count > 0 {
            buf.put_u8(bits);
            bits = 0;
            bit_count = 0;
        }
        match (spec.field_type, value) {
            (FieldType::Bit, FieldValue::Bit(v)) => {
                if bit_count == 8 {
                    buf.put_u8(bits);
                    bits = 0;
                    bit_count = 0;
                }
                if *v {
                    bits |= 1 << bit_count;
                }
                bit_count += 1;
            }
            (FieldType::Octet, FieldValue::Octet(v)) => buf.put_u8(*v),
            (FieldType::Short, FieldValue::Short(v)) => buf.put_u16(*v),
            (FieldType::Long, FieldValue::Long(v)) => buf.put_u32(*v),
            (FieldType::LongLong, FieldValue::LongLong(v)) => buf.put_u64(*v),
            (FieldType::Timestamp, FieldValue::Timestamp(v)) => buf.put_u64(*v),
            (FieldType::ShortStr, FieldValue::ShortStr(v)) => put_short_str(buf, v, spec.name)?,
            (FieldType::LongStr, FieldValue::LongStr(v)) => put_long_str(buf, v, spec.name)?,
            (FieldType::Table, FieldValue::Table(v)) => put_table(buf, v)?,
            (expected, _) => {
                return Err(EncodeError::FieldType {
                    method: method.name,
                    field: spec.name,
                    expected: expected.name(),
                })
            }
        }
    }
    if bit_count > 0 {
        buf.put_u8(bits);
    }
    Ok(())
}

fn decode_fields(
    reader: &mut WireReader<'_>,
    method: &'static MethodType,
) -> Result<Vec<FieldValue>, DecodeError> {
    let mut fields = Vec::with_capacity(method.fields.len());
    let mut bits: u8 = 0;
    let mut bit_count = 0u8;

    for spec in method.fields {
        if spec.field_type != FieldType::Bit {
            bit_count = 0;
        }
        let value = match spec.field_type {
            FieldType::Bit => {
                if bit_count == 0 || bit_count == 8 {
                    bits = reader.read_u8(spec.name)?;
                    bit_count = 0;
                }
                let v = bits & (1 << bit_count) != 0;
                bit_count += 1;
                FieldValue::Bit(v)
            }
            FieldType::Octet => FieldValue::Octet(reader.read_u8(spec.name)?),
            FieldType::Short => FieldValue::Short(reader.read_u16(spec.name)?),
            FieldType::Long => FieldValue::Long(reader.read_u32(spec.name)?),
            FieldType::LongLong => FieldValue::LongLong(reader.read_u64(spec.name)?),
            FieldType::Timestamp => FieldValue::Timestamp(reader.read_u64(spec.name)?),
            FieldType::ShortStr => FieldValue::ShortStr(reader.read_short_str(spec.name)?),
            FieldType::LongStr => FieldValue::LongStr(reader.read_long_str(spec.name)?),
            FieldType::Table => FieldValue::Table(reader.read_table(spec.name)?),
        };
        fields.push(value);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::FieldTable;

    #[test]
    fn test_standard_registry_has_every_kind() {
        let registry = MethodRegistry::standard();
        assert_eq!(registry.len(), MethodKind::ALL.len());
        for kind in MethodKind::ALL {
            let (class_id, method_id) = kind.ids();
            assert_eq!(registry.lookup(class_id, method_id).map(|m| m.kind), Some(kind));
        }
        assert!(registry.has_class(10));
        assert!(registry.has_class(20));
        assert!(!registry.has_class(60));
    }

    #[test]
    fn test_standard_registry_has_unique_ids() {
        let registry = MethodRegistry::try_standard().unwrap();
        assert_eq!(registry.len(), MethodKind::ALL.len());

        let err = MethodRegistry::builder()
            .register_all(MethodKind::ALL)
            .unwrap()
            .register(MethodKind::ChannelFlow.descriptor())
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                class_id: 20,
                method_id: 20
            }
        );
    }

    #[test]
    fn test_duplicate_registration_is_error() {
        let err = MethodRegistry::builder()
            .register(MethodKind::ConnectionOpen.descriptor())
            .unwrap()
            .register(MethodKind::ConnectionOpen.descriptor())
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                class_id: 10,
                method_id: 40
            }
        );
    }

    #[test]
    fn test_register_all_partial_registry() {
        let registry = MethodRegistry::builder()
            .register_all([MethodKind::ConnectionClose, MethodKind::ConnectionCloseOk])
            .unwrap()
            .build();
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(10, 40).is_none());
    }

    #[test]
    fn test_unknown_method() {
        let registry = MethodRegistry::standard();
        assert_eq!(
            registry.decode_payload(&[0, 10, 0, 99]),
            Err(DecodeError::UnknownMethod {
                class_id: 10,
                method_id: 99
            })
        );
    }

    #[test]
    fn test_open_wire_bytes() {
        let registry = MethodRegistry::standard();
        let payload = registry.encode(&MethodInstance::connection_open("/a")).unwrap();
        // ids, shortstr "/a", empty shortstr, bit octet
        assert_eq!(&payload[..], &[0, 10, 0, 40, 2, b'/', b'a', 0, 0]);
    }

    #[test]
    fn test_open_insist_bit_decodes() {
        let registry = MethodRegistry::standard();
        let open = registry
            .decode_payload(&[0, 10, 0, 40, 1, b'/', 0, 1])
            .unwrap();
        assert_eq!(open.short_str("virtual-host"), Some("/"));
        assert_eq!(open.bit("insist"), Some(true));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let registry = MethodRegistry::standard();
        assert_eq!(
            registry.decode_payload(&[0, 10, 0, 51, 0xff]),
            Err(DecodeError::TrailingBytes {
                method: "connection.close-ok",
                remaining: 1
            })
        );
    }

    #[test]
    fn test_truncated_string_rejected() {
        let registry = MethodRegistry::standard();
        // shortstr claims 5 bytes, only 2 present
        assert_eq!(
            registry.decode_payload(&[0, 10, 0, 40, 5, b'/', b'a']),
            Err(DecodeError::Truncated {
                context: "virtual-host"
            })
        );
        assert_eq!(
            registry.decode_payload(&[0, 10]),
            Err(DecodeError::PayloadTooShort)
        );
    }

    #[test]
    fn test_start_ok_roundtrip_with_table() {
        let registry = MethodRegistry::standard();
        let props = FieldTable::new()
            .with("product", "test-client")
            .with("capabilities", FieldTable::new().with("basic.nack", true));
        let start_ok = MethodInstance::connection_start_ok(
            props,
            "PLAIN",
            Bytes::from_static(b"\0guest\0guest"),
            "en_US",
        );
        let frame = registry.encode_frame(0, &start_ok).unwrap();
        assert_eq!(frame.method_ids(), Some((10, 11)));
        assert_eq!(registry.decode_frame(&frame).unwrap(), Some(start_ok));
    }

    #[test]
    fn test_non_method_frame_is_not_decoded() {
        let registry = MethodRegistry::standard();
        assert_eq!(registry.decode_frame(&Frame::heartbeat()).unwrap(), None);
    }

    #[test]
    fn test_encode_rejects_oversized_shortstr() {
        let registry = MethodRegistry::standard();
        let open = MethodInstance::new(
            MethodKind::ConnectionOpen,
            vec![
                FieldValue::ShortStr("v".repeat(300)),
                FieldValue::ShortStr(String::new()),
                FieldValue::Bit(false),
            ],
        )
        .unwrap();
        assert!(matches!(
            registry.encode(&open),
            Err(EncodeError::ValueTooWide {
                context: "virtual-host",
                ..
            })
        ));
    }
}
