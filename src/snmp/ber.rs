//! Minimal BER encode/decode for the SNMPv2c GET exchange.
//!
//! Only the subset a GET round-trip needs is implemented: definite lengths
//! (short and long form), INTEGER, OCTET STRING, NULL, OBJECT IDENTIFIER,
//! SEQUENCE, the SMI application types, and the varbind exception markers.
//! Indefinite lengths and constructed strings are rejected.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::Oid;

// Universal tags.
const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

// SMI application types.
const TAG_IPADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_OPAQUE: u8 = 0x44;
const TAG_COUNTER64: u8 = 0x46;

// PDU tags.
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_RESPONSE: u8 = 0xA2;

// Varbind exceptions (context class, primitive).
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;

/// SNMPv2c version field value.
const VERSION_2C: i64 = 1;

#[derive(Debug, Error)]
pub enum BerError {
    #[error("truncated message")]
    Truncated,
    #[error("unsupported length encoding (byte {0:#04x})")]
    UnsupportedLength(u8),
    #[error("expected tag {expected:#04x}, got {got:#04x}")]
    UnexpectedTag { expected: u8, got: u8 },
    #[error("integer out of range ({0} bytes)")]
    IntegerOverflow(usize),
    #[error("malformed object identifier")]
    MalformedOid,
    #[error("unexpected PDU tag {got:#04x} (wanted {expected:#04x})")]
    UnexpectedPdu { expected: u8, got: u8 },
    #[error("response carries no varbind")]
    EmptyVarbindList,
}

/// A decoded varbind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    Counter32(u64),
    Gauge32(u64),
    TimeTicks(u64),
    Counter64(u64),
    OctetString(Vec<u8>),
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Null,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    /// A tag this decoder does not interpret; kept so the caller can report it.
    Unsupported(u8),
}

impl SnmpValue {
    /// Numeric reading of the value, if it has one.
    pub fn as_bits(&self) -> Option<i64> {
        match self {
            SnmpValue::Integer(v) => Some(*v),
            SnmpValue::Counter32(v) | SnmpValue::Gauge32(v) | SnmpValue::TimeTicks(v) => {
                i64::try_from(*v).ok()
            }
            SnmpValue::Counter64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// A decoded PDU, reduced to the single varbind it carries.
#[derive(Debug, Clone)]
pub struct Pdu {
    pub request_id: i64,
    pub error_status: i64,
    pub error_index: i64,
    pub oid: Oid,
    pub value: SnmpValue,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_len(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let tail = &bytes[skip..];
        buf.put_u8(0x80 | tail.len() as u8);
        buf.put_slice(tail);
    }
}

fn put_tlv(buf: &mut BytesMut, tag: u8, content: &[u8]) {
    buf.put_u8(tag);
    put_len(buf, content.len());
    buf.put_slice(content);
}

fn put_integer(buf: &mut BytesMut, value: i64) {
    let bytes = value.to_be_bytes();
    // Minimal two's-complement encoding: drop redundant leading bytes.
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        if (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    put_tlv(buf, TAG_INTEGER, &bytes[start..]);
}

fn encode_oid(oid: &Oid) -> Result<Vec<u8>, BerError> {
    let arcs = oid.arcs();
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        return Err(BerError::MalformedOid);
    }
    let mut out = Vec::with_capacity(arcs.len() + 1);
    put_base128(&mut out, arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        put_base128(&mut out, *arc);
    }
    Ok(out)
}

fn put_base128(out: &mut Vec<u8>, mut value: u32) {
    let mut chunk = [0u8; 5];
    let mut n = 0;
    loop {
        chunk[n] = (value & 0x7F) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let mut b = chunk[i];
        if i != 0 {
            b |= 0x80;
        }
        out.push(b);
    }
}

fn put_unsigned(buf: &mut BytesMut, tag: u8, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    let tail = &bytes[skip..];
    if tail[0] & 0x80 != 0 {
        // Pad so the value does not read as negative.
        let mut padded = Vec::with_capacity(tail.len() + 1);
        padded.push(0);
        padded.extend_from_slice(tail);
        put_tlv(buf, tag, &padded);
    } else {
        put_tlv(buf, tag, tail);
    }
}

fn put_value(buf: &mut BytesMut, value: &SnmpValue) -> Result<(), BerError> {
    match value {
        SnmpValue::Integer(v) => put_integer(buf, *v),
        SnmpValue::Counter32(v) => put_unsigned(buf, TAG_COUNTER32, *v),
        SnmpValue::Gauge32(v) => put_unsigned(buf, TAG_GAUGE32, *v),
        SnmpValue::TimeTicks(v) => put_unsigned(buf, TAG_TIMETICKS, *v),
        SnmpValue::Counter64(v) => put_unsigned(buf, TAG_COUNTER64, *v),
        SnmpValue::OctetString(v) => put_tlv(buf, TAG_OCTET_STRING, v),
        SnmpValue::ObjectId(oid) => put_tlv(buf, TAG_OID, &encode_oid(oid)?),
        SnmpValue::IpAddress(octets) => put_tlv(buf, TAG_IPADDRESS, octets),
        SnmpValue::Null => put_tlv(buf, TAG_NULL, &[]),
        SnmpValue::NoSuchObject => put_tlv(buf, TAG_NO_SUCH_OBJECT, &[]),
        SnmpValue::NoSuchInstance => put_tlv(buf, TAG_NO_SUCH_INSTANCE, &[]),
        SnmpValue::EndOfMibView => put_tlv(buf, TAG_END_OF_MIB_VIEW, &[]),
        SnmpValue::Unsupported(tag) => put_tlv(buf, *tag, &[]),
    }
    Ok(())
}

fn encode_message(
    community: &str,
    pdu_tag: u8,
    request_id: i64,
    error_status: i64,
    error_index: i64,
    oid: &Oid,
    value: &SnmpValue,
) -> Result<Bytes, BerError> {
    let mut varbind = BytesMut::new();
    put_tlv(&mut varbind, TAG_OID, &encode_oid(oid)?);
    put_value(&mut varbind, value)?;

    let mut vblist = BytesMut::new();
    put_tlv(&mut vblist, TAG_SEQUENCE, &varbind);

    let mut pdu = BytesMut::new();
    put_integer(&mut pdu, request_id);
    put_integer(&mut pdu, error_status);
    put_integer(&mut pdu, error_index);
    put_tlv(&mut pdu, TAG_SEQUENCE, &vblist);

    let mut body = BytesMut::new();
    put_integer(&mut body, VERSION_2C);
    put_tlv(&mut body, TAG_OCTET_STRING, community.as_bytes());
    put_tlv(&mut body, pdu_tag, &pdu);

    let mut msg = BytesMut::new();
    put_tlv(&mut msg, TAG_SEQUENCE, &body);
    Ok(msg.freeze())
}

/// Encode a GetResponse with a single varbind.
///
/// The client never sends one of these; it exists for the loopback fakes in
/// the test suite and to keep the codec symmetric.
pub fn encode_response(
    community: &str,
    request_id: i64,
    error_status: i64,
    error_index: i64,
    oid: &Oid,
    value: &SnmpValue,
) -> Result<Bytes, BerError> {
    encode_message(
        community,
        TAG_RESPONSE,
        request_id,
        error_status,
        error_index,
        oid,
        value,
    )
}

/// Encode a GetRequest with a single varbind.
pub fn encode_get_request(
    community: &str,
    request_id: i64,
    oid: &Oid,
) -> Result<Bytes, BerError> {
    encode_message(
        community,
        TAG_GET_REQUEST,
        request_id,
        0,
        0,
        oid,
        &SnmpValue::Null,
    )
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BerError> {
        if self.buf.len() < n {
            return Err(BerError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Read one TLV, returning the tag and the content slice.
    fn tlv(&mut self) -> Result<(u8, &'a [u8]), BerError> {
        let tag = self.take(1)?[0];
        let first = self.take(1)?[0];
        let len = if first < 0x80 {
            first as usize
        } else {
            let n = (first & 0x7F) as usize;
            if n == 0 || n > 4 {
                return Err(BerError::UnsupportedLength(first));
            }
            let mut len = 0usize;
            for b in self.take(n)? {
                len = (len << 8) | *b as usize;
            }
            len
        };
        Ok((tag, self.take(len)?))
    }

    fn expect(&mut self, expected: u8) -> Result<&'a [u8], BerError> {
        let (tag, content) = self.tlv()?;
        if tag != expected {
            return Err(BerError::UnexpectedTag { expected, got: tag });
        }
        Ok(content)
    }

    fn integer(&mut self) -> Result<i64, BerError> {
        let content = self.expect(TAG_INTEGER)?;
        decode_signed(content)
    }
}

fn decode_signed(content: &[u8]) -> Result<i64, BerError> {
    if content.is_empty() || content.len() > 8 {
        return Err(BerError::IntegerOverflow(content.len()));
    }
    let mut value = if content[0] & 0x80 != 0 { -1i64 } else { 0 };
    for b in content {
        value = (value << 8) | *b as i64;
    }
    Ok(value)
}

fn decode_unsigned(content: &[u8]) -> Result<u64, BerError> {
    // Unsigned SMI types may carry a leading 0x00 pad byte.
    let trimmed = if content.first() == Some(&0) {
        &content[1..]
    } else {
        content
    };
    if trimmed.len() > 8 {
        return Err(BerError::IntegerOverflow(content.len()));
    }
    let mut value = 0u64;
    for b in trimmed {
        value = (value << 8) | *b as u64;
    }
    Ok(value)
}

fn decode_oid(content: &[u8]) -> Result<Oid, BerError> {
    if content.is_empty() {
        return Err(BerError::MalformedOid);
    }
    let mut arcs = Vec::with_capacity(content.len() + 1);
    let mut iter = content.iter();
    let first = read_base128(&mut iter)?;
    if first < 80 {
        arcs.push(first / 40);
        arcs.push(first % 40);
    } else {
        arcs.push(2);
        arcs.push(first - 80);
    }
    while iter.as_slice().first().is_some() {
        arcs.push(read_base128(&mut iter)?);
    }
    Ok(Oid::from_arcs(arcs))
}

fn read_base128(iter: &mut std::slice::Iter<'_, u8>) -> Result<u32, BerError> {
    let mut value: u32 = 0;
    for _ in 0..5 {
        let b = *iter.next().ok_or(BerError::MalformedOid)?;
        value = value
            .checked_shl(7)
            .ok_or(BerError::MalformedOid)?
            | (b & 0x7F) as u32;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(BerError::MalformedOid)
}

fn decode_value(tag: u8, content: &[u8]) -> Result<SnmpValue, BerError> {
    Ok(match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_signed(content)?),
        TAG_COUNTER32 => SnmpValue::Counter32(decode_unsigned(content)?),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_unsigned(content)?),
        TAG_TIMETICKS => SnmpValue::TimeTicks(decode_unsigned(content)?),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content)?),
        TAG_OCTET_STRING | TAG_OPAQUE => SnmpValue::OctetString(content.to_vec()),
        TAG_OID => SnmpValue::ObjectId(decode_oid(content)?),
        TAG_IPADDRESS => {
            let octets: [u8; 4] = content.try_into().map_err(|_| BerError::Truncated)?;
            SnmpValue::IpAddress(octets)
        }
        TAG_NULL => SnmpValue::Null,
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => SnmpValue::Unsupported(other),
    })
}

fn decode_with_tag(buf: &[u8], expected_tag: u8) -> Result<Pdu, BerError> {
    let mut msg = Reader::new(buf);
    let mut body = Reader::new(msg.expect(TAG_SEQUENCE)?);

    let _version = body.integer()?;
    let _community = body.expect(TAG_OCTET_STRING)?;

    let (pdu_tag, pdu) = body.tlv()?;
    if pdu_tag != expected_tag {
        return Err(BerError::UnexpectedPdu {
            expected: expected_tag,
            got: pdu_tag,
        });
    }

    let mut pdu = Reader::new(pdu);
    let request_id = pdu.integer()?;
    let error_status = pdu.integer()?;
    let error_index = pdu.integer()?;

    let mut vblist = Reader::new(pdu.expect(TAG_SEQUENCE)?);
    if vblist.is_empty() {
        return Err(BerError::EmptyVarbindList);
    }
    let mut varbind = Reader::new(vblist.expect(TAG_SEQUENCE)?);
    let oid = decode_oid(varbind.expect(TAG_OID)?)?;
    let (value_tag, value_content) = varbind.tlv()?;
    let value = decode_value(value_tag, value_content)?;

    Ok(Pdu {
        request_id,
        error_status,
        error_index,
        oid,
        value,
    })
}

/// Decode a GetResponse message, returning its first varbind.
pub fn decode_response(buf: &[u8]) -> Result<Pdu, BerError> {
    decode_with_tag(buf, TAG_RESPONSE)
}

/// Decode a GetRequest message. The client never receives one; this is the
/// other half of the codec, used by the loopback agents in the test suite.
pub fn decode_get_request(buf: &[u8]) -> Result<Pdu, BerError> {
    decode_with_tag(buf, TAG_GET_REQUEST)
}
