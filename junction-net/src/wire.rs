//! Wire primitives shared with browser peers: unsigned varints, the varint
//! length prefix every stream frame carries, and the few protobuf field
//! encodings the direct message and peer discovery messages use.

use std::io;

use futures::prelude::*;

use crate::error::NetworkError;

/// Longest varint accepted; enough for any u64.
const MAX_VARINT_LEN: usize = 10;

const WIRE_TYPE_VARINT: u64 = 0;
const WIRE_TYPE_FIXED64: u64 = 1;
const WIRE_TYPE_LEN: u64 = 2;
const WIRE_TYPE_FIXED32: u64 = 5;

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a varint from the front of `buf`. Returns the value and the number
/// of bytes it occupied.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), NetworkError> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(codec_error("truncated or overlong varint"))
}

/// Prefix `payload` with its varint length.
pub fn length_prefixed(payload: &[u8], max: usize) -> Result<Vec<u8>, NetworkError> {
    if payload.len() > max {
        return Err(NetworkError::MessageTooLarge {
            size: payload.len(),
            max,
        });
    }
    let mut out = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    write_varint(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Read one varint length-prefixed frame.
///
/// Returns `None` when the stream ends cleanly before the first byte of the
/// prefix. A stream that ends inside a frame is an error.
pub async fn read_length_prefixed<T>(io: &mut T, max: usize) -> io::Result<Option<Vec<u8>>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        if io.read(&mut byte).await? == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        len |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 != 0 {
            continue;
        }

        let len = usize::try_from(len).map_err(|_| invalid_data("frame length overflows"))?;
        if len > max {
            return Err(invalid_data(format!(
                "message too large: {} bytes (max {})",
                len, max
            )));
        }
        let mut buf = vec![0u8; len];
        io.read_exact(&mut buf).await?;
        return Ok(Some(buf));
    }
    Err(invalid_data("overlong varint length prefix"))
}

/// Builder for a protobuf message body.
#[derive(Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn varint(mut self, field: u32, value: u64) -> Self {
        self.key(field, WIRE_TYPE_VARINT);
        write_varint(&mut self.buf, value);
        self
    }

    pub fn bytes(mut self, field: u32, value: &[u8]) -> Self {
        self.key(field, WIRE_TYPE_LEN);
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(self, field: u32, value: &str) -> Self {
        self.bytes(field, value.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn key(&mut self, field: u32, wire_type: u64) {
        write_varint(&mut self.buf, (u64::from(field) << 3) | wire_type);
    }
}

/// One decoded protobuf field value. Fixed-width fields are surfaced raw so
/// callers can skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn as_string(&self) -> Result<String, NetworkError> {
        match self {
            FieldValue::Bytes(b) => String::from_utf8(b.to_vec())
                .map_err(|e| codec_error(format!("invalid utf-8 string field: {}", e))),
            _ => Err(codec_error("expected a length-delimited field")),
        }
    }
}

/// Iterator over the `(field number, value)` pairs of a protobuf message.
/// Stops after the first malformed field.
pub struct ProtoReader<'a> {
    buf: &'a [u8],
}

impl<'a> ProtoReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_field(&mut self) -> Result<(u32, FieldValue<'a>), NetworkError> {
        let (key, used) = decode_varint(self.buf)?;
        self.buf = &self.buf[used..];
        let field = u32::try_from(key >> 3).map_err(|_| codec_error("field number overflows"))?;

        let value = match key & 0x7 {
            WIRE_TYPE_VARINT => {
                let (value, used) = decode_varint(self.buf)?;
                self.buf = &self.buf[used..];
                FieldValue::Varint(value)
            }
            WIRE_TYPE_LEN => {
                let (len, used) = decode_varint(self.buf)?;
                let rest = &self.buf[used..];
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= rest.len())
                    .ok_or_else(|| codec_error("length-delimited field runs past the end"))?;
                self.buf = &rest[len..];
                FieldValue::Bytes(&rest[..len])
            }
            WIRE_TYPE_FIXED64 => FieldValue::Fixed(self.take(8)?),
            WIRE_TYPE_FIXED32 => FieldValue::Fixed(self.take(4)?),
            other => return Err(codec_error(format!("unsupported wire type {}", other))),
        };
        Ok((field, value))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], NetworkError> {
        if self.buf.len() < n {
            return Err(codec_error("fixed-width field runs past the end"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }
}

impl<'a> Iterator for ProtoReader<'a> {
    type Item = Result<(u32, FieldValue<'a>), NetworkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let field = self.read_field();
        if field.is_err() {
            self.buf = &[];
        }
        Some(field)
    }
}

pub fn codec_error(reason: impl Into<String>) -> NetworkError {
    NetworkError::Codec {
        reason: reason.into(),
    }
}

fn invalid_data(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut out = Vec::new();
        write_varint(&mut out, 1);
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0x01, 0xac, 0x02]);

        assert_eq!(decode_varint(&[0xac, 0x02, 0xff]).unwrap(), (300, 2));
        assert!(decode_varint(&[0x80]).is_err());
        assert!(decode_varint(&[0xff; 11]).is_err());
    }

    #[test]
    fn test_length_prefix_is_a_single_varint() {
        assert_eq!(length_prefixed(b"f1", 16).unwrap(), vec![2, b'f', b'1']);
        assert!(matches!(
            length_prefixed(&[0u8; 17], 16),
            Err(NetworkError::MessageTooLarge { size: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_and_clean_end_of_stream() {
        let mut io = futures::io::Cursor::new(vec![2, b'f', b'1']);
        assert_eq!(
            read_length_prefixed(&mut io, 16).await.unwrap(),
            Some(b"f1".to_vec())
        );
        assert_eq!(read_length_prefixed(&mut io, 16).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_truncation_and_oversize() {
        let mut truncated = futures::io::Cursor::new(vec![5, b'a']);
        assert!(read_length_prefixed(&mut truncated, 16).await.is_err());

        let mut cut_prefix = futures::io::Cursor::new(vec![0x80]);
        assert!(read_length_prefixed(&mut cut_prefix, 16).await.is_err());

        let mut oversized = futures::io::Cursor::new(vec![0xac, 0x02]);
        assert!(read_length_prefixed(&mut oversized, 16).await.is_err());
    }

    #[test]
    fn test_proto_writer_and_reader_agree() {
        let body = ProtoWriter::new()
            .bytes(1, b"key")
            .varint(2, 200)
            .string(3, "text")
            .finish();
        assert_eq!(&body[..5], &[0x0a, 0x03, b'k', b'e', b'y']);

        let fields: Vec<_> = ProtoReader::new(&body)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            fields,
            vec![
                (1, FieldValue::Bytes(b"key")),
                (2, FieldValue::Varint(200)),
                (3, FieldValue::Bytes(b"text")),
            ]
        );
    }

    #[test]
    fn test_reader_skips_fixed_fields_and_stops_on_garbage() {
        // field 4 fixed64, then field 1 varint 7
        let mut body = vec![0x21];
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&[0x08, 0x07]);
        let fields: Vec<_> = ProtoReader::new(&body)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(fields[1], (1, FieldValue::Varint(7)));

        let mut reader = ProtoReader::new(&[0x0a, 0x05, b'a']);
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
