//! Fixed-size frame header.
//!
//! Header layout (48 ASCII bytes):
//!
//! ```text
//! +------+---+--------+---+--------------------------------------+---+-----+----+
//! | type | . | length | . | id                                   | . | end | \n |
//! | 1    | 1 | 6      | 1 | 36                                   | 1 | 1   | 1  |
//! +------+---+--------+---+--------------------------------------+---+-----+----+
//!   @0     @1  @2       @8  @9                                     @45 @46   @47
//! ```
//!
//! Example: `A.000168.68e999ca-a651-40f4-ad8f-3aaf781862b4.1\n`

use crate::error::ProtocolError;
use crate::{MAX_HEADER_LENGTH, MAX_LENGTH};
use bytes::{BufMut, BytesMut};
use std::fmt;
use uuid::Uuid;

const DELIMITER: u8 = b'.';
const TERMINATOR: u8 = b'\n';

const TYPE_OFFSET: usize = 0;
const TYPE_DELIMITER_OFFSET: usize = 1;
const LENGTH_OFFSET: usize = 2;
const LENGTH_LENGTH: usize = 6;
const LENGTH_DELIMITER_OFFSET: usize = 8;
const ID_OFFSET: usize = 9;
const ID_LENGTH: usize = 36;
const ID_DELIMITER_OFFSET: usize = 45;
const END_OFFSET: usize = 46;
const TERMINATOR_OFFSET: usize = 47;

/// Kind of payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// JSON request body.
    Request,
    /// JSON response body.
    Response,
    /// Raw bytes of a content stream.
    Stream,
    /// Cancel every stream of the connection.
    CancelAll,
    /// Cancel the stream named by the frame id.
    CancelStream,
}

impl PayloadType {
    /// Returns the single-character wire code.
    pub fn code(self) -> u8 {
        match self {
            PayloadType::Request => b'A',
            PayloadType::Response => b'B',
            PayloadType::Stream => b'S',
            PayloadType::CancelAll => b'X',
            PayloadType::CancelStream => b'C',
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            b'A' => Ok(PayloadType::Request),
            b'B' => Ok(PayloadType::Response),
            b'S' => Ok(PayloadType::Stream),
            b'X' => Ok(PayloadType::CancelAll),
            b'C' => Ok(PayloadType::CancelStream),
            other => Err(ProtocolError::UnknownPayloadType(other as char)),
        }
    }

    /// Returns whether frames of this type carry a JSON message body.
    pub fn is_message(self) -> bool {
        matches!(self, PayloadType::Request | PayloadType::Response)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code() as char)
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload kind.
    pub payload_type: PayloadType,
    /// Number of body bytes following the header.
    pub payload_length: usize,
    /// Stream or request identifier.
    pub id: Uuid,
    /// Whether this frame completes its logical stream.
    pub end: bool,
}

impl Header {
    pub fn new(payload_type: PayloadType, id: Uuid) -> Self {
        Self {
            payload_type,
            payload_length: 0,
            id,
            end: false,
        }
    }

    pub fn with_length(mut self, payload_length: usize) -> Self {
        self.payload_length = payload_length;
        self
    }

    pub fn with_end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }

    /// Serializes the header into `dst` starting at `offset`.
    ///
    /// Returns the number of bytes written, which is always
    /// [`MAX_HEADER_LENGTH`].
    pub fn serialize(&self, dst: &mut [u8], offset: usize) -> Result<usize, ProtocolError> {
        if self.payload_length > MAX_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload_length,
                max: MAX_LENGTH,
            });
        }
        let available = dst.len().saturating_sub(offset);
        if available < MAX_HEADER_LENGTH {
            return Err(ProtocolError::InvalidHeaderLength {
                expected: MAX_HEADER_LENGTH,
                actual: available,
            });
        }

        let out = &mut dst[offset..offset + MAX_HEADER_LENGTH];
        out[TYPE_OFFSET] = self.payload_type.code();
        out[TYPE_DELIMITER_OFFSET] = DELIMITER;

        let mut length = self.payload_length;
        for slot in out[LENGTH_OFFSET..LENGTH_OFFSET + LENGTH_LENGTH]
            .iter_mut()
            .rev()
        {
            *slot = b'0' + (length % 10) as u8;
            length /= 10;
        }
        out[LENGTH_DELIMITER_OFFSET] = DELIMITER;

        self.id
            .hyphenated()
            .encode_lower(&mut out[ID_OFFSET..ID_OFFSET + ID_LENGTH]);
        out[ID_DELIMITER_OFFSET] = DELIMITER;

        out[END_OFFSET] = if self.end { b'1' } else { b'0' };
        out[TERMINATOR_OFFSET] = TERMINATOR;

        Ok(MAX_HEADER_LENGTH)
    }

    /// Encodes the header into a fixed-size array.
    pub fn encode(&self) -> Result<[u8; MAX_HEADER_LENGTH], ProtocolError> {
        let mut buf = [0u8; MAX_HEADER_LENGTH];
        self.serialize(&mut buf, 0)?;
        Ok(buf)
    }

    /// Appends the encoded header to `dst`.
    pub fn encode_to(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let encoded = self.encode()?;
        dst.reserve(MAX_HEADER_LENGTH);
        dst.put_slice(&encoded);
        Ok(())
    }

    /// Deserializes a header from `count` bytes of `buf` starting at `offset`.
    ///
    /// `count` must be exactly [`MAX_HEADER_LENGTH`].
    pub fn deserialize(buf: &[u8], offset: usize, count: usize) -> Result<Self, ProtocolError> {
        if count != MAX_HEADER_LENGTH || buf.len() < offset + count {
            return Err(ProtocolError::InvalidHeaderLength {
                expected: MAX_HEADER_LENGTH,
                actual: count.min(buf.len().saturating_sub(offset)),
            });
        }
        Self::decode(&buf[offset..offset + count])
    }

    /// Decodes a header from exactly [`MAX_HEADER_LENGTH`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != MAX_HEADER_LENGTH {
            return Err(ProtocolError::InvalidHeaderLength {
                expected: MAX_HEADER_LENGTH,
                actual: buf.len(),
            });
        }

        if buf[TYPE_DELIMITER_OFFSET] != DELIMITER {
            return Err(ProtocolError::InvalidTypeDelimiter(
                buf[TYPE_DELIMITER_OFFSET],
            ));
        }
        if buf[LENGTH_DELIMITER_OFFSET] != DELIMITER {
            return Err(ProtocolError::InvalidLengthDelimiter(
                buf[LENGTH_DELIMITER_OFFSET],
            ));
        }
        if buf[ID_DELIMITER_OFFSET] != DELIMITER {
            return Err(ProtocolError::InvalidIdDelimiter(buf[ID_DELIMITER_OFFSET]));
        }
        if buf[TERMINATOR_OFFSET] != TERMINATOR {
            return Err(ProtocolError::InvalidTerminator(buf[TERMINATOR_OFFSET]));
        }

        let payload_type = PayloadType::from_code(buf[TYPE_OFFSET])?;

        let length_field = &buf[LENGTH_OFFSET..LENGTH_OFFSET + LENGTH_LENGTH];
        if !length_field.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::InvalidPayloadLength(
                String::from_utf8_lossy(length_field).into_owned(),
            ));
        }
        let payload_length = length_field
            .iter()
            .fold(0usize, |acc, digit| acc * 10 + (digit - b'0') as usize);

        let id_field = &buf[ID_OFFSET..ID_OFFSET + ID_LENGTH];
        let id = std::str::from_utf8(id_field)
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                ProtocolError::InvalidId(String::from_utf8_lossy(id_field).into_owned())
            })?;

        let end = match buf[END_OFFSET] {
            b'0' => false,
            b'1' => true,
            other => return Err(ProtocolError::InvalidEndFlag(other)),
        };

        Ok(Self {
            payload_type,
            payload_length,
            id,
            end,
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}.{}.{}",
            self.payload_type,
            self.payload_length,
            self.id,
            u8::from(self.end)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &[u8; 48] = b"A.000168.68e999ca-a651-40f4-ad8f-3aaf781862b4.1\n";

    fn sample_id() -> Uuid {
        Uuid::parse_str("68e999ca-a651-40f4-ad8f-3aaf781862b4").unwrap()
    }

    fn corrupt(offset: usize, byte: u8) -> Vec<u8> {
        let mut buf = SAMPLE.to_vec();
        buf[offset] = byte;
        buf
    }

    #[test]
    fn test_decode_literal_vector() {
        let header = Header::decode(SAMPLE).unwrap();
        assert_eq!(header.payload_type, PayloadType::Request);
        assert_eq!(header.payload_length, 168);
        assert_eq!(header.id, sample_id());
        assert!(header.end);
    }

    #[test]
    fn test_encode_literal_vector() {
        let header = Header::new(PayloadType::Request, sample_id())
            .with_length(168)
            .with_end(true);
        assert_eq!(&header.encode().unwrap(), SAMPLE);
        assert_eq!(
            header.to_string(),
            "A.000168.68e999ca-a651-40f4-ad8f-3aaf781862b4.1"
        );
    }

    #[test]
    fn test_serialize_at_offset() {
        let header = Header::new(PayloadType::Stream, sample_id()).with_length(7);
        let mut buf = vec![0xAAu8; 10 + MAX_HEADER_LENGTH];

        let written = header.serialize(&mut buf, 10).unwrap();
        assert_eq!(written, MAX_HEADER_LENGTH);
        assert!(buf[..10].iter().all(|b| *b == 0xAA));

        let decoded = Header::deserialize(&buf, 10, MAX_HEADER_LENGTH).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_serialize_buffer_too_small() {
        let header = Header::new(PayloadType::Stream, sample_id());
        let mut buf = [0u8; 40];
        let result = header.serialize(&mut buf, 0);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidHeaderLength { actual: 40, .. })
        ));
    }

    #[test]
    fn test_serialize_length_overflow() {
        let header = Header::new(PayloadType::Stream, sample_id()).with_length(MAX_LENGTH + 1);
        assert!(matches!(
            header.encode(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_to_appends() {
        let mut buf = BytesMut::from(&b"xy"[..]);
        let header = Header::new(PayloadType::CancelAll, sample_id());
        header.encode_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 2 + MAX_HEADER_LENGTH);
        assert_eq!(Header::decode(&buf[2..]).unwrap(), header);
    }

    #[test]
    fn test_wrong_total_length() {
        let result = Header::deserialize(SAMPLE, 0, 47);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidHeaderLength {
                expected: 48,
                actual: 47
            })
        ));

        let result = Header::decode(&SAMPLE[..20]);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidHeaderLength { actual: 20, .. })
        ));
    }

    #[test]
    fn test_bad_type_delimiter() {
        let result = Header::decode(&corrupt(1, b'+'));
        assert!(matches!(result, Err(ProtocolError::InvalidTypeDelimiter(b'+'))));
    }

    #[test]
    fn test_bad_length_delimiter() {
        let result = Header::decode(&corrupt(8, b'+'));
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidLengthDelimiter(b'+'))
        ));
    }

    #[test]
    fn test_bad_id_delimiter() {
        let result = Header::decode(&corrupt(45, b'+'));
        assert!(matches!(result, Err(ProtocolError::InvalidIdDelimiter(b'+'))));
    }

    #[test]
    fn test_bad_terminator() {
        let result = Header::decode(&corrupt(47, b'\r'));
        assert!(matches!(result, Err(ProtocolError::InvalidTerminator(b'\r'))));
    }

    #[test]
    fn test_unparseable_length() {
        let result = Header::decode(&corrupt(4, b'z'));
        assert!(matches!(result, Err(ProtocolError::InvalidPayloadLength(_))));

        // A sign is not a digit even though integer parsing would accept it.
        let result = Header::decode(&corrupt(2, b'+'));
        assert!(matches!(result, Err(ProtocolError::InvalidPayloadLength(_))));
    }

    #[test]
    fn test_unparseable_id() {
        let result = Header::decode(&corrupt(12, b'g'));
        assert!(matches!(result, Err(ProtocolError::InvalidId(_))));

        // Hyphen moved out of its canonical position.
        let result = Header::decode(&corrupt(17, b'0'));
        assert!(matches!(result, Err(ProtocolError::InvalidId(_))));
    }

    #[test]
    fn test_bad_end_flag() {
        let result = Header::decode(&corrupt(46, b'2'));
        assert!(matches!(result, Err(ProtocolError::InvalidEndFlag(b'2'))));
    }

    #[test]
    fn test_unknown_payload_type() {
        let result = Header::decode(&corrupt(0, b'Q'));
        assert!(matches!(result, Err(ProtocolError::UnknownPayloadType('Q'))));
    }

    #[test]
    fn test_uppercase_id_accepted() {
        let upper = String::from_utf8(SAMPLE.to_vec()).unwrap().to_uppercase();
        let header = Header::decode(upper.as_bytes()).unwrap();
        assert_eq!(header.id, sample_id());
    }

    #[test]
    fn test_payload_type_codes() {
        for ty in [
            PayloadType::Request,
            PayloadType::Response,
            PayloadType::Stream,
            PayloadType::CancelAll,
            PayloadType::CancelStream,
        ] {
            assert_eq!(PayloadType::from_code(ty.code()).unwrap(), ty);
        }
        assert!(PayloadType::Request.is_message());
        assert!(PayloadType::Response.is_message());
        assert!(!PayloadType::Stream.is_message());
        assert!(!PayloadType::CancelStream.is_message());
    }

    fn payload_type_strategy() -> impl Strategy<Value = PayloadType> {
        prop_oneof![
            Just(PayloadType::Request),
            Just(PayloadType::Response),
            Just(PayloadType::Stream),
            Just(PayloadType::CancelAll),
            Just(PayloadType::CancelStream),
        ]
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            payload_type in payload_type_strategy(),
            payload_length in 0usize..=MAX_LENGTH,
            raw_id in any::<u128>(),
            end in any::<bool>(),
        ) {
            let header = Header {
                payload_type,
                payload_length,
                id: Uuid::from_u128(raw_id),
                end,
            };
            let encoded = header.encode().unwrap();
            prop_assert_eq!(encoded.len(), MAX_HEADER_LENGTH);
            prop_assert_eq!(Header::decode(&encoded).unwrap(), header);
        }
    }
}
