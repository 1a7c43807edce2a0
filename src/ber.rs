//! BER packet tree shared by the client and the server.
//!
//! LDAP only uses a small slice of X.690: definite lengths, the universal
//! types BOOLEAN/INTEGER/OCTET STRING/ENUMERATED/SEQUENCE/SET, and
//! application- or context-tagged selectors. Everything decodes into a
//! [`Packet`] tree so the message layer never touches raw bytes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Per-packet size cap, enforced before any allocation happens.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

pub const TAG_BOOLEAN: u32 = 0x01;
pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_ENUMERATED: u32 = 0x0a;
pub const TAG_SEQUENCE: u32 = 0x10;
pub const TAG_SET: u32 = 0x11;

/// BER decoding errors
#[derive(Debug, thiserror::Error)]
pub enum BerError {
    #[error("truncated packet")]
    Truncated,
    #[error("indefinite lengths are not supported")]
    IndefiniteLength,
    #[error("length encoding too long")]
    LengthOverflow,
    #[error("tag number too large")]
    TagOverflow,
    #[error("packet of {0} bytes exceeds the {1} byte limit")]
    Oversized(usize, usize),
    #[error("integer out of range")]
    IntegerRange,
    #[error("expected a primitive value")]
    ExpectedPrimitive,
    #[error("expected a constructed value")]
    ExpectedConstructed,
    #[error("unexpected tag: {0:?} {1}")]
    UnexpectedTag(TagClass, u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketValue {
    Primitive(Bytes),
    Constructed(Vec<Packet>),
}

/// One BER TLV: an identifier plus either a payload or child packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub class: TagClass,
    pub tag: u32,
    pub value: PacketValue,
}

impl Packet {
    pub fn primitive<B: Into<Bytes>>(class: TagClass, tag: u32, payload: B) -> Self {
        Packet {
            class,
            tag,
            value: PacketValue::Primitive(payload.into()),
        }
    }

    pub fn constructed(class: TagClass, tag: u32, children: Vec<Packet>) -> Self {
        Packet {
            class,
            tag,
            value: PacketValue::Constructed(children),
        }
    }

    pub fn sequence(children: Vec<Packet>) -> Self {
        Self::constructed(TagClass::Universal, TAG_SEQUENCE, children)
    }

    pub fn set(children: Vec<Packet>) -> Self {
        Self::constructed(TagClass::Universal, TAG_SET, children)
    }

    pub fn integer(value: i64) -> Self {
        Self::primitive(TagClass::Universal, TAG_INTEGER, int_bytes(value))
    }

    pub fn enumerated(value: i64) -> Self {
        Self::primitive(TagClass::Universal, TAG_ENUMERATED, int_bytes(value))
    }

    pub fn boolean(value: bool) -> Self {
        let payload = if value { &[0xffu8][..] } else { &[0x00u8][..] };
        Self::primitive(TagClass::Universal, TAG_BOOLEAN, payload.to_vec())
    }

    pub fn octet_string<B: Into<Bytes>>(payload: B) -> Self {
        Self::primitive(TagClass::Universal, TAG_OCTET_STRING, payload)
    }

    pub fn context(tag: u32, children: Vec<Packet>) -> Self {
        Self::constructed(TagClass::Context, tag, children)
    }

    pub fn context_primitive<B: Into<Bytes>>(tag: u32, payload: B) -> Self {
        Self::primitive(TagClass::Context, tag, payload)
    }

    pub fn application(tag: u32, children: Vec<Packet>) -> Self {
        Self::constructed(TagClass::Application, tag, children)
    }

    pub fn application_primitive<B: Into<Bytes>>(tag: u32, payload: B) -> Self {
        Self::primitive(TagClass::Application, tag, payload)
    }

    pub fn is(&self, class: TagClass, tag: u32) -> bool {
        self.class == class && self.tag == tag
    }

    pub fn expect(&self, class: TagClass, tag: u32) -> Result<&Self, BerError> {
        if self.is(class, tag) {
            Ok(self)
        } else {
            Err(BerError::UnexpectedTag(self.class, self.tag))
        }
    }

    pub fn payload(&self) -> Result<&Bytes, BerError> {
        match &self.value {
            PacketValue::Primitive(payload) => Ok(payload),
            PacketValue::Constructed(_) => Err(BerError::ExpectedPrimitive),
        }
    }

    pub fn children(&self) -> Result<&[Packet], BerError> {
        match &self.value {
            PacketValue::Constructed(children) => Ok(children),
            PacketValue::Primitive(_) => Err(BerError::ExpectedConstructed),
        }
    }

    pub fn into_children(self) -> Result<Vec<Packet>, BerError> {
        match self.value {
            PacketValue::Constructed(children) => Ok(children),
            PacketValue::Primitive(_) => Err(BerError::ExpectedConstructed),
        }
    }

    pub fn as_i64(&self) -> Result<i64, BerError> {
        int_from_bytes(self.payload()?)
    }

    /// Any non-zero octet decodes as true.
    pub fn as_bool(&self) -> Result<bool, BerError> {
        Ok(self.payload()?.iter().any(|&b| b != 0))
    }

    /// Payload as text. LDAP strings are UTF-8 in practice; stray bytes are
    /// replaced rather than failing the whole message.
    pub fn as_string(&self) -> Result<String, BerError> {
        Ok(String::from_utf8_lossy(self.payload()?).into_owned())
    }
}

/// Minimal-length two's-complement encoding of an integer.
pub(crate) fn int_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

pub(crate) fn int_from_bytes(data: &[u8]) -> Result<i64, BerError> {
    if data.is_empty() || data.len() > 8 {
        return Err(BerError::IntegerRange);
    }
    let mut value: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in data {
        value = (value << 8) | i64::from(b);
    }
    Ok(value)
}

/// Encode a packet into a fresh buffer.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(packet, &mut buf);
    buf.freeze()
}

pub fn encode_into(packet: &Packet, buf: &mut BytesMut) {
    match &packet.value {
        PacketValue::Primitive(payload) => {
            put_identifier(buf, packet.class, false, packet.tag);
            put_length(buf, payload.len());
            buf.put_slice(payload);
        }
        PacketValue::Constructed(children) => {
            let mut inner = BytesMut::new();
            for child in children {
                encode_into(child, &mut inner);
            }
            put_identifier(buf, packet.class, true, packet.tag);
            put_length(buf, inner.len());
            buf.put_slice(&inner);
        }
    }
}

fn put_identifier(buf: &mut BytesMut, class: TagClass, constructed: bool, tag: u32) {
    let mut first = match class {
        TagClass::Universal => 0x00,
        TagClass::Application => 0x40,
        TagClass::Context => 0x80,
        TagClass::Private => 0xc0,
    };
    if constructed {
        first |= 0x20;
    }
    if tag <= 30 {
        buf.put_u8(first | tag as u8);
    } else {
        buf.put_u8(first | 0x1f);
        let mut groups = [0u8; 5];
        let mut n = 0;
        let mut rest = tag;
        loop {
            groups[n] = (rest & 0x7f) as u8;
            n += 1;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        for i in (1..n).rev() {
            buf.put_u8(groups[i] | 0x80);
        }
        buf.put_u8(groups[0]);
    }
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        buf.put_u8(0x80 | (bytes.len() - skip) as u8);
        buf.put_slice(&bytes[skip..]);
    }
}

struct Header {
    class: TagClass,
    constructed: bool,
    tag: u32,
    header_len: usize,
    content_len: usize,
}

/// Parse identifier and length octets. `Ok(None)` means more bytes are
/// needed; hard failures (indefinite length, oversized packets) surface
/// before any content is buffered.
fn parse_header(data: &[u8], limit: usize) -> Result<Option<Header>, BerError> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };
    let class = match first >> 6 {
        0 => TagClass::Universal,
        1 => TagClass::Application,
        2 => TagClass::Context,
        _ => TagClass::Private,
    };
    let constructed = first & 0x20 != 0;
    let mut pos = 1;

    let tag = if first & 0x1f != 0x1f {
        u32::from(first & 0x1f)
    } else {
        let mut tag: u32 = 0;
        loop {
            let Some(&b) = data.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            if tag > u32::MAX >> 7 {
                return Err(BerError::TagOverflow);
            }
            tag = (tag << 7) | u32::from(b & 0x7f);
            if b & 0x80 == 0 {
                break;
            }
        }
        tag
    };

    let Some(&len0) = data.get(pos) else {
        return Ok(None);
    };
    pos += 1;
    let content_len = if len0 & 0x80 == 0 {
        usize::from(len0)
    } else {
        let octets = usize::from(len0 & 0x7f);
        if octets == 0 {
            return Err(BerError::IndefiniteLength);
        }
        if octets > 8 {
            return Err(BerError::LengthOverflow);
        }
        if data.len() < pos + octets {
            return Ok(None);
        }
        let mut len: u64 = 0;
        for &b in &data[pos..pos + octets] {
            len = (len << 8) | u64::from(b);
        }
        pos += octets;
        usize::try_from(len).map_err(|_| BerError::LengthOverflow)?
    };

    if content_len > limit {
        return Err(BerError::Oversized(content_len, limit));
    }

    Ok(Some(Header {
        class,
        constructed,
        tag,
        header_len: pos,
        content_len,
    }))
}

/// Total on-wire size of the first TLV in `data`, or `None` if the header
/// is still incomplete.
pub fn total_len(data: &[u8], limit: usize) -> Result<Option<usize>, BerError> {
    Ok(parse_header(data, limit)?.map(|h| h.header_len + h.content_len))
}

/// Decode one packet and all nested children, returning the byte count
/// consumed.
pub fn decode(data: &[u8], limit: usize) -> Result<(Packet, usize), BerError> {
    let header = parse_header(data, limit)?.ok_or(BerError::Truncated)?;
    let end = header.header_len + header.content_len;
    if data.len() < end {
        return Err(BerError::Truncated);
    }
    let content = &data[header.header_len..end];
    let value = if header.constructed {
        let mut children = Vec::new();
        let mut pos = 0;
        while pos < content.len() {
            let (child, used) = decode(&content[pos..], limit)?;
            children.push(child);
            pos += used;
        }
        PacketValue::Constructed(children)
    } else {
        PacketValue::Primitive(Bytes::copy_from_slice(content))
    };
    Ok((
        Packet {
            class: header.class,
            tag: header.tag,
            value,
        },
        end,
    ))
}

/// Read exactly one top-level TLV from an async reader. Premature EOF is a
/// transport fault.
pub async fn read_packet<R>(reader: &mut R, limit: usize) -> Result<Packet, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(32);
    let total = loop {
        if let Some(total) = total_len(&buf, limit)? {
            break total;
        }
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        buf.push(byte[0]);
    };
    let have = buf.len();
    buf.resize(total, 0);
    if total > have {
        reader.read_exact(&mut buf[have..]).await?;
    }
    let (packet, _) = decode(&buf, limit)?;
    Ok(packet)
}
