use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/*
    Canonical structured encoding shared by every protocol message.

    An item is either a byte string or a list of items. Lengths use the
    shortest prefix that fits, integers are big-endian with no leading zero
    bytes (zero is the empty string). Decoding rejects anything a correct
    encoder would not have produced, so two equal values always share a
    single encoding.
*/

const STRING_SHORT: u8 = 0x80;
const STRING_LONG: u8 = 0xb7;
const LIST_SHORT: u8 = 0xc0;
const LIST_LONG: u8 = 0xf7;
const SHORT_LIMIT: usize = 55;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("extra data found: {0} bytes")]
    ExtraData(usize),
    #[error("non-canonical encoding")]
    NonCanonical,
    #[error("integer too wide: {0} bytes")]
    IntegerOverflow(usize),
    #[error("expected a list")]
    ExpectedList,
    #[error("expected a byte string")]
    ExpectedBytes,
    #[error("wrong field count: expected {expected}, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("wrong length: expected {expected}, found {found}")]
    Length { expected: usize, found: usize },
    #[error("unknown type tag: {0:#04x}")]
    UnknownTag(u8),
    #[error("invalid data in {0}: {1}")]
    InvalidData(&'static str, String),
}

fn put_header(buf: &mut BytesMut, len: usize, short: u8, long: u8) {
    if len <= SHORT_LIMIT {
        buf.put_u8(short + len as u8);
        return;
    }
    let be = len.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    buf.put_u8(long + (be.len() - skip) as u8);
    buf.put_slice(&be[skip..]);
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    if data.len() == 1 && data[0] < STRING_SHORT {
        buf.put_u8(data[0]);
        return;
    }
    put_header(buf, data.len(), STRING_SHORT, STRING_LONG);
    buf.put_slice(data);
}

fn trimmed(value: u64) -> ([u8; 8], usize) {
    let be = value.to_be_bytes();
    let skip = be.iter().take_while(|b| **b == 0).count();
    (be, skip)
}

/// Encodes a single byte string item.
pub fn encode_bytes(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 9);
    put_bytes(&mut buf, data);
    buf.freeze()
}

/// Encodes an unsigned integer as a minimal big-endian byte string.
pub fn encode_uint(value: u64) -> Bytes {
    let (be, skip) = trimmed(value);
    encode_bytes(&be[skip..])
}

/// Builds a list item field by field.
#[derive(Default)]
pub struct ListEncoder {
    body: BytesMut,
}

impl ListEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uint(mut self, value: u64) -> Self {
        let (be, skip) = trimmed(value);
        put_bytes(&mut self.body, &be[skip..]);
        self
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        put_bytes(&mut self.body, data);
        self
    }

    /// Appends an item that is already encoded.
    pub fn raw(mut self, encoded: &[u8]) -> Self {
        self.body.put_slice(encoded);
        self
    }

    /// Appends a nested list whose elements are byte strings.
    pub fn list<I, B>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut nested = ListEncoder::new();
        for item in items {
            nested = nested.bytes(item.as_ref());
        }
        self.body.put_slice(&nested.finish());
        self
    }

    pub fn finish(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.body.len() + 9);
        put_header(&mut buf, self.body.len(), LIST_SHORT, LIST_LONG);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

struct Header {
    is_list: bool,
    offset: usize,
    len: usize,
}

fn read_len(buf: &[u8], width: usize) -> Result<usize, DecodeError> {
    if width > std::mem::size_of::<usize>() {
        return Err(DecodeError::IntegerOverflow(width));
    }
    let bytes = buf.get(..width).ok_or(DecodeError::EndOfBuffer)?;
    if bytes.first() == Some(&0) {
        return Err(DecodeError::NonCanonical);
    }
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len <= SHORT_LIMIT {
        return Err(DecodeError::NonCanonical);
    }
    Ok(len)
}

fn read_header(buf: &[u8]) -> Result<Header, DecodeError> {
    let first = *buf.first().ok_or(DecodeError::EndOfBuffer)?;
    let header = match first {
        0x00..=0x7f => Header { is_list: false, offset: 0, len: 1 },
        0x80..=0xb7 => Header { is_list: false, offset: 1, len: (first - STRING_SHORT) as usize },
        0xb8..=0xbf => {
            let width = (first - STRING_LONG) as usize;
            let len = read_len(&buf[1..], width)?;
            Header { is_list: false, offset: 1 + width, len }
        }
        0xc0..=0xf7 => Header { is_list: true, offset: 1, len: (first - LIST_SHORT) as usize },
        0xf8..=0xff => {
            let width = (first - LIST_LONG) as usize;
            let len = read_len(&buf[1..], width)?;
            Header { is_list: true, offset: 1 + width, len }
        }
    };

    let end = header.offset.checked_add(header.len).ok_or(DecodeError::EndOfBuffer)?;
    if end > buf.len() {
        return Err(DecodeError::EndOfBuffer);
    }
    // A single byte below 0x80 must be encoded as itself.
    if !header.is_list && header.offset == 1 && header.len == 1 && buf[1] < STRING_SHORT {
        return Err(DecodeError::NonCanonical);
    }
    Ok(header)
}

/// A borrowed view over exactly one encoded item.
#[derive(Clone, Copy, Debug)]
pub struct Rlp<'a> {
    raw: &'a [u8],
    is_list: bool,
    payload: &'a [u8],
}

impl<'a> Rlp<'a> {
    /// Parses `buf` as a single item, rejecting trailing bytes.
    pub fn new(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let header = read_header(buf)?;
        let end = header.offset + header.len;
        if end < buf.len() {
            return Err(DecodeError::ExtraData(buf.len() - end));
        }
        Ok(Rlp {
            raw: buf,
            is_list: header.is_list,
            payload: &buf[header.offset..end],
        })
    }

    pub fn is_list(&self) -> bool {
        self.is_list
    }

    /// The full encoding of this item, header included.
    pub fn as_raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn data(&self) -> Result<&'a [u8], DecodeError> {
        if self.is_list {
            return Err(DecodeError::ExpectedBytes);
        }
        Ok(self.payload)
    }

    pub fn as_u64(&self) -> Result<u64, DecodeError> {
        let data = self.data()?;
        if data.len() > 8 {
            return Err(DecodeError::IntegerOverflow(data.len()));
        }
        if data.first() == Some(&0) {
            return Err(DecodeError::NonCanonical);
        }
        Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    pub fn as_usize(&self) -> Result<usize, DecodeError> {
        let value = self.as_u64()?;
        usize::try_from(value).map_err(|_| DecodeError::IntegerOverflow(8))
    }

    pub fn fixed<const N: usize>(&self) -> Result<[u8; N], DecodeError> {
        let data = self.data()?;
        data.try_into().map_err(|_| DecodeError::Length {
            expected: N,
            found: data.len(),
        })
    }

    pub fn items(&self) -> Result<Vec<Rlp<'a>>, DecodeError> {
        if !self.is_list {
            return Err(DecodeError::ExpectedList);
        }
        let mut items = Vec::new();
        let mut rest = self.payload;
        while !rest.is_empty() {
            let header = read_header(rest)?;
            let end = header.offset + header.len;
            items.push(Rlp {
                raw: &rest[..end],
                is_list: header.is_list,
                payload: &rest[header.offset..end],
            });
            rest = &rest[end..];
        }
        Ok(items)
    }

    /// Like [`Rlp::items`] but requires exactly `expected` fields.
    pub fn fields(&self, expected: usize) -> Result<Vec<Rlp<'a>>, DecodeError> {
        let items = self.items()?;
        if items.len() != expected {
            return Err(DecodeError::FieldCount {
                expected,
                found: items.len(),
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode_bytes(b"dog").as_ref(), &[0x83, b'd', b'o', b'g']);
        assert_eq!(encode_bytes(b"").as_ref(), &[0x80]);
        assert_eq!(encode_uint(0).as_ref(), &[0x80]);
        assert_eq!(encode_uint(15).as_ref(), &[0x0f]);
        assert_eq!(encode_uint(1024).as_ref(), &[0x82, 0x04, 0x00]);

        let list = ListEncoder::new().bytes(b"cat").bytes(b"dog").finish();
        assert_eq!(
            list.as_ref(),
            &[0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
    }

    #[test]
    fn test_long_string_header() {
        let data = [7u8; 56];
        let encoded = encode_bytes(&data);
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(Rlp::new(&encoded).unwrap().data().unwrap(), &data[..]);
    }

    #[test]
    fn test_nested_fields() {
        let inner = ListEncoder::new().uint(1).uint(2).finish();
        let outer = ListEncoder::new().raw(&inner).bytes(b"x").finish();
        let rlp = Rlp::new(&outer).unwrap();
        let fields = rlp.fields(2).unwrap();
        let nested = fields[0].fields(2).unwrap();
        assert_eq!(nested[1].as_u64().unwrap(), 2);
        assert_eq!(fields[1].data().unwrap(), b"x");
        assert_eq!(fields[0].as_raw(), inner.as_ref());
    }

    #[test]
    fn test_rejects_trailing_data() {
        let mut encoded = encode_bytes(b"dog").to_vec();
        encoded.push(0);
        assert_eq!(Rlp::new(&encoded).unwrap_err(), DecodeError::ExtraData(1));
    }

    #[test]
    fn test_rejects_truncated() {
        assert_eq!(Rlp::new(&[0x83, b'd']).unwrap_err(), DecodeError::EndOfBuffer);
        assert_eq!(Rlp::new(&[]).unwrap_err(), DecodeError::EndOfBuffer);
    }

    #[test]
    fn test_rejects_non_canonical() {
        // single small byte wrapped in a header
        assert_eq!(Rlp::new(&[0x81, 0x05]).unwrap_err(), DecodeError::NonCanonical);
        // long form used for a short string
        assert_eq!(Rlp::new(&[0xb8, 0x01, 0xff]).unwrap_err(), DecodeError::NonCanonical);
        // integer with a leading zero
        let rlp = Rlp::new(&[0x82, 0x00, 0x01]).unwrap();
        assert_eq!(rlp.as_u64().unwrap_err(), DecodeError::NonCanonical);
    }

    #[test]
    fn test_field_count_mismatch() {
        let list = ListEncoder::new().uint(1).finish();
        let err = Rlp::new(&list).unwrap().fields(2).unwrap_err();
        assert_eq!(err, DecodeError::FieldCount { expected: 2, found: 1 });
    }

    #[test]
    fn test_integer_overflow() {
        let encoded = encode_bytes(&[1u8; 9]);
        let err = Rlp::new(&encoded).unwrap().as_u64().unwrap_err();
        assert_eq!(err, DecodeError::IntegerOverflow(9));
    }

    proptest! {
        #[test]
        fn prop_uint_decodes_to_itself(value in any::<u64>()) {
            let encoded = encode_uint(value);
            prop_assert_eq!(Rlp::new(&encoded).unwrap().as_u64().unwrap(), value);
        }

        #[test]
        fn prop_bytes_decode_to_themselves(data in prop::collection::vec(any::<u8>(), 0..300)) {
            let encoded = encode_bytes(&data);
            prop_assert_eq!(Rlp::new(&encoded).unwrap().data().unwrap(), &data[..]);
        }
    }
}
