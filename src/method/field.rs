//! Field types and their wire encodings.
//!
//! Method arguments use the AMQP 0-9-1 domain types:
//!
//! | Type        | Wire                                   |
//! |-------------|----------------------------------------|
//! | `bit`       | packed into octets, LSB first          |
//! | `octet`     | u8                                     |
//! | `short`     | u16 BE                                 |
//! | `long`      | u32 BE                                 |
//! | `longlong`  | u64 BE                                 |
//! | `shortstr`  | u8 length + UTF-8 bytes (max 255)      |
//! | `longstr`   | u32 length + bytes                     |
//! | `timestamp` | u64 BE                                 |
//! | `table`     | u32 length + `shortstr key, tag, value`* |

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};

/// Declared wire type of a method field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bit,
    Octet,
    Short,
    Long,
    LongLong,
    ShortStr,
    LongStr,
    Timestamp,
    Table,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Bit => "bit",
            FieldType::Octet => "octet",
            FieldType::Short => "short",
            FieldType::Long => "long",
            FieldType::LongLong => "longlong",
            FieldType::ShortStr => "shortstr",
            FieldType::LongStr => "longstr",
            FieldType::Timestamp => "timestamp",
            FieldType::Table => "table",
        }
    }
}

/// A decoded method argument.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bit(bool),
    Octet(u8),
    Short(u16),
    Long(u32),
    LongLong(u64),
    ShortStr(String),
    LongStr(Bytes),
    Timestamp(u64),
    Table(FieldTable),
}

impl FieldValue {
    /// Wire type this value encodes as.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bit(_) => FieldType::Bit,
            FieldValue::Octet(_) => FieldType::Octet,
            FieldValue::Short(_) => FieldType::Short,
            FieldValue::Long(_) => FieldType::Long,
            FieldValue::LongLong(_) => FieldType::LongLong,
            FieldValue::ShortStr(_) => FieldType::ShortStr,
            FieldValue::LongStr(_) => FieldType::LongStr,
            FieldValue::Timestamp(_) => FieldType::Timestamp,
            FieldValue::Table(_) => FieldType::Table,
        }
    }
}

/// A value inside a field table or array.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal { scale: u8, value: u32 },
    LongStr(Bytes),
    Array(Vec<TableValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    Bytes(Bytes),
}

impl TableValue {
    fn tag(&self) -> u8 {
        match self {
            TableValue::Bool(_) => b't',
            TableValue::I8(_) => b'b',
            TableValue::U8(_) => b'B',
            TableValue::I16(_) => b's',
            TableValue::U16(_) => b'u',
            TableValue::I32(_) => b'I',
            TableValue::U32(_) => b'i',
            TableValue::I64(_) => b'l',
            TableValue::F32(_) => b'f',
            TableValue::F64(_) => b'd',
            TableValue::Decimal { .. } => b'D',
            TableValue::LongStr(_) => b'S',
            TableValue::Array(_) => b'A',
            TableValue::Timestamp(_) => b'T',
            TableValue::Table(_) => b'F',
            TableValue::Void => b'V',
            TableValue::Bytes(_) => b'x',
        }
    }

    /// Convenience for string-valued entries.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TableValue::LongStr(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

impl From<&str> for TableValue {
    fn from(value: &str) -> Self {
        TableValue::LongStr(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<bool> for TableValue {
    fn from(value: bool) -> Self {
        TableValue::Bool(value)
    }
}

/// Ordered field table. Entry order is preserved through decode and encode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable {
    entries: Vec<(String, TableValue)>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TableValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<TableValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&TableValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<FieldTable> for TableValue {
    fn from(value: FieldTable) -> Self {
        TableValue::Table(value)
    }
}

/// Cursor over a method payload.
///
/// Every read either returns a complete value or `DecodeError::Truncated`;
/// nothing is consumed on failure.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated { context });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self, context: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, context)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, context)?[0])
    }

    pub fn read_u16(&mut self, context: &'static str) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array(context)?))
    }

    pub fn read_u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array(context)?))
    }

    pub fn read_u64(&mut self, context: &'static str) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array(context)?))
    }

    pub fn read_short_str(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let len = self.read_u8(context)? as usize;
        let raw = self.take(len, context)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { context })
    }

    pub fn read_long_str(&mut self, context: &'static str) -> Result<Bytes, DecodeError> {
        let len = self.read_u32(context)? as usize;
        Ok(Bytes::copy_from_slice(self.take(len, context)?))
    }

    pub fn read_table(&mut self, context: &'static str) -> Result<FieldTable, DecodeError> {
        let len = self.read_u32(context)? as usize;
        let mut inner = WireReader::new(self.take(len, context)?);
        let mut table = FieldTable::new();
        while inner.remaining() > 0 {
            let key = inner.read_short_str("table key")?;
            let value = inner.read_table_value()?;
            table.entries.push((key, value));
        }
        Ok(table)
    }

    fn read_table_value(&mut self) -> Result<TableValue, DecodeError> {
        const CTX: &str = "table value";
        let tag = self.read_u8(CTX)?;
        let value = match tag {
            b't' => TableValue::Bool(self.read_u8(CTX)? != 0),
            b'b' => TableValue::I8(self.read_u8(CTX)? as i8),
            b'B' => TableValue::U8(self.read_u8(CTX)?),
            b's' => TableValue::I16(self.read_u16(CTX)? as i16),
            b'u' => TableValue::U16(self.read_u16(CTX)?),
            b'I' => TableValue::I32(self.read_u32(CTX)? as i32),
            b'i' => TableValue::U32(self.read_u32(CTX)?),
            b'l' => TableValue::I64(self.read_u64(CTX)? as i64),
            b'f' => TableValue::F32(f32::from_bits(self.read_u32(CTX)?)),
            b'd' => TableValue::F64(f64::from_bits(self.read_u64(CTX)?)),
            b'D' => TableValue::Decimal {
                scale: self.read_u8(CTX)?,
                value: self.read_u32(CTX)?,
            },
            b'S' => TableValue::LongStr(self.read_long_str(CTX)?),
            b'A' => {
                let len = self.read_u32(CTX)? as usize;
                let mut inner = WireReader::new(self.take(len, CTX)?);
                let mut items = Vec::new();
                while inner.remaining() > 0 {
                    items.push(inner.read_table_value()?);
                }
                TableValue::Array(items)
            }
            b'T' => TableValue::Timestamp(self.read_u64(CTX)?),
            b'F' => TableValue::Table(self.read_table(CTX)?),
            b'V' => TableValue::Void,
            b'x' => TableValue::Bytes(self.read_long_str(CTX)?),
            other => return Err(DecodeError::UnknownFieldTag { tag: other }),
        };
        Ok(value)
    }
}

/// Write a short string, enforcing the 255-byte wire width.
pub fn put_short_str(buf: &mut BytesMut, value: &str, context: &'static str) -> Result<(), EncodeError> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(EncodeError::ValueTooWide {
            context,
            len,
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Write a long string, enforcing the u32 length prefix.
pub fn put_long_str(buf: &mut BytesMut, value: &[u8], context: &'static str) -> Result<(), EncodeError> {
    let len = value.len();
    if len > u32::MAX as usize {
        return Err(EncodeError::ValueTooWide {
            context,
            len,
            max: u32::MAX as usize,
        });
    }
    buf.put_u32(len as u32);
    buf.put_slice(value);
    Ok(())
}

/// Write a field table with its u32 length prefix.
pub fn put_table(buf: &mut BytesMut, table: &FieldTable) -> Result<(), EncodeError> {
    let mut body = BytesMut::new();
    for (key, value) in &table.entries {
        put_short_str(&mut body, key, "table key")?;
        put_table_value(&mut body, value)?;
    }
    put_long_str(buf, &body, "table")
}

fn put_table_value(buf: &mut BytesMut, value: &TableValue) -> Result<(), EncodeError> {
    buf.put_u8(value.tag());
    match value {
        TableValue::Bool(v) => buf.put_u8(u8::from(*v)),
        TableValue::I8(v) => buf.put_i8(*v),
        TableValue::U8(v) => buf.put_u8(*v),
        TableValue::I16(v) => buf.put_i16(*v),
        TableValue::U16(v) => buf.put_u16(*v),
        TableValue::I32(v) => buf.put_i32(*v),
        TableValue::U32(v) => buf.put_u32(*v),
        TableValue::I64(v) => buf.put_i64(*v),
        TableValue::F32(v) => buf.put_u32(v.to_bits()),
        TableValue::F64(v) => buf.put_u64(v.to_bits()),
        TableValue::Decimal { scale, value } => {
            buf.put_u8(*scale);
            buf.put_u32(*value);
        }
        TableValue::LongStr(v) | TableValue::Bytes(v) => put_long_str(buf, v, "table value")?,
        TableValue::Array(items) => {
            let mut body = BytesMut::new();
            for item in items {
                put_table_value(&mut body, item)?;
            }
            put_long_str(buf, &body, "array")?;
        }
        TableValue::Timestamp(v) => buf.put_u64(*v),
        TableValue::Table(t) => put_table(buf, t)?,
        TableValue::Void => {}
    }
    Ok(())
}
