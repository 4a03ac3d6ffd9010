//! Minimal DNS wire codec
//!
//! Just enough DNS to terminate tunnel queries: parse a query into an
//! immutable snapshot, encode answers for the record types the tunnel
//! speaks, and synthesise the NS/A responses that make the zone look
//! plausible to recursive resolvers.
//!
//! Owner names are kept as raw bytes throughout; clients using the base128
//! codec put non-ASCII octets in labels, and resolvers are free to play
//! case games that dedup needs to observe verbatim.

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use bytes::{BufMut, BytesMut};

use crate::codec::{b32_char, Codec, Downenc};
use crate::TunnelError;

/// Maximum bytes in one DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Maximum total owner-name length.
const MAX_NAME_LEN: usize = 253;

/// Response TTL; short, since every answer is unique anyway.
const ANSWER_TTL: u32 = 0;

/// Response flags: QR, AA, RD, RA.
const RESPONSE_FLAGS: u16 = 0x8580;

/// Record types the tunnel answers. `Private` is the private-use type some
/// clients prefer over NULL for middlebox reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Ns,
    Cname,
    Null,
    Mx,
    Txt,
    Srv,
    Private,
}

impl QueryType {
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(QueryType::A),
            2 => Some(QueryType::Ns),
            5 => Some(QueryType::Cname),
            10 => Some(QueryType::Null),
            15 => Some(QueryType::Mx),
            16 => Some(QueryType::Txt),
            33 => Some(QueryType::Srv),
            65399 => Some(QueryType::Private),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Null => 10,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Srv => 33,
            QueryType::Private => 65399,
        }
    }

    /// Whether answers of this type carry arbitrary octets in RDATA.
    pub fn is_binary(self) -> bool {
        matches!(self, QueryType::Null | QueryType::Private)
    }
}

/// Immutable snapshot of an inbound query.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: u16,
    pub qtype: QueryType,
    /// Dotted owner name exactly as read from the wire.
    pub name: Vec<u8>,
    pub from: SocketAddr,
    /// Address the resolver reached us on, when known.
    pub destination: Option<IpAddr>,
    pub time_recv: Instant,
}

impl Query {
    pub fn name_utf8(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// Parse a query packet into a snapshot. Returns `None` for packets that
/// are not plain single-question queries of a supported type; those are
/// dropped upstream without ceremony.
pub fn parse_query(
    packet: &[u8],
    from: SocketAddr,
    destination: Option<IpAddr>,
) -> Result<Query, TunnelError> {
    if packet.len() < 12 {
        return Err(TunnelError::BadPacket("query shorter than header".into()));
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 != 0 {
        return Err(TunnelError::BadPacket("response on query socket".into()));
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(TunnelError::BadPacket("no question".into()));
    }

    let mut name = Vec::new();
    let mut pos = 12;
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| TunnelError::BadPacket("truncated name".into()))? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LEN || pos + len > packet.len() {
            return Err(TunnelError::BadPacket("bad label length".into()));
        }
        if !name.is_empty() {
            name.push(b'.');
        }
        name.extend_from_slice(&packet[pos..pos + len]);
        if name.len() > MAX_NAME_LEN {
            return Err(TunnelError::BadPacket("name too long".into()));
        }
        pos += len;
    }
    if pos + 4 > packet.len() {
        return Err(TunnelError::BadPacket("truncated question".into()));
    }
    let qtype_raw = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qtype = QueryType::from_wire(qtype_raw)
        .ok_or_else(|| TunnelError::BadPacket(format!("unsupported qtype {qtype_raw}")))?;

    Ok(Query {
        id,
        qtype,
        name,
        from,
        destination,
        time_recv: Instant::now(),
    })
}

/// DNS id of any packet, for matching forwarded replies.
pub fn query_id(packet: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*packet.first()?, *packet.get(1)?]))
}

/// Encode a dotted name into wire labels.
fn put_name(out: &mut BytesMut, name: &[u8]) -> Result<(), TunnelError> {
    for label in name.split(|&b| b == b'.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(TunnelError::BadPacket("label too long".into()));
        }
        out.put_u8(label.len() as u8);
        out.put_slice(label);
    }
    out.put_u8(0);
    Ok(())
}

fn put_header(out: &mut BytesMut, id: u16, flags: u16, ancount: u16, arcount: u16) {
    out.put_u16(id);
    out.put_u16(flags);
    out.put_u16(1); // QDCOUNT
    out.put_u16(ancount);
    out.put_u16(0); // NSCOUNT
    out.put_u16(arcount);
}

fn put_question(out: &mut BytesMut, q: &Query) -> Result<(), TunnelError> {
    put_name(out, &q.name)?;
    out.put_u16(q.qtype.to_wire());
    out.put_u16(1); // IN
    Ok(())
}

fn put_rr_head(out: &mut BytesMut, rtype: u16) {
    out.put_u16(0xC00C); // name: pointer to the question
    out.put_u16(rtype);
    out.put_u16(1); // IN
    out.put_u32(ANSWER_TTL);
}

/// Re-encode a parsed query, used when relaying to the sibling resolver.
pub fn encode_query(q: &Query) -> Result<Vec<u8>, TunnelError> {
    let mut out = BytesMut::with_capacity(64);
    put_header(&mut out, q.id, 0x0100, 0, 0);
    put_question(&mut out, q)?;
    Ok(out.to_vec())
}

/// Rotating 10-bit counter rendered as a two-character pseudo-TLD, appended
/// to data-bearing answer names so resolver caches never coalesce them.
pub fn cmc_label(counter: &mut u16) -> [u8; 2] {
    *counter = (*counter + 1) & 0x3FF;
    [
        b32_char((*counter & 0x1F) as u8),
        b32_char((*counter >> 5) as u8),
    ]
}

/// Marker character identifying the codec of a name-encoded answer.
fn name_marker(downenc: Downenc) -> (u8, Codec) {
    match downenc {
        Downenc::Base64 => (b'i', Codec::Base64),
        Downenc::Base64Url => (b'j', Codec::Base64Url),
        Downenc::Base128 => (b'k', Codec::Base128),
        // base32 is the floor; raw cannot ride in names
        Downenc::Base32 | Downenc::Raw => (b'h', Codec::Base32),
    }
}

/// Marker character for TXT answers; raw payloads are legal here.
fn txt_marker(downenc: Downenc) -> (u8, Option<Codec>) {
    match downenc {
        Downenc::Base64 => (b's', Some(Codec::Base64)),
        Downenc::Base64Url => (b'u', Some(Codec::Base64Url)),
        Downenc::Base128 => (b'v', Some(Codec::Base128)),
        Downenc::Raw => (b'r', None),
        Downenc::Base32 => (b't', Some(Codec::Base32)),
    }
}

/// Build a data-carrying hostname: marker, encoded payload split into
/// labels, rotating CMC pseudo-TLD. Returns the number of payload bytes
/// that fit; the remainder is the caller's to re-chunk.
fn build_hostname(
    payload: &[u8],
    downenc: Downenc,
    cmc: &mut u16,
) -> (Vec<u8>, usize) {
    let (marker, codec) = name_marker(downenc);
    // marker + dots + 2-char TLD + label-length overhead must fit 253
    let max_chars = MAX_NAME_LEN
        - 1 // marker
        - 3 // ".xx" pseudo-TLD
        - (MAX_NAME_LEN / (MAX_LABEL_LEN + 1) + 1); // dots between labels
    let take = payload.len().min(codec.raw_length(max_chars));
    let encoded = codec.encode(&payload[..take]);

    let mut name = Vec::with_capacity(encoded.len() + 8);
    let mut label_len = 0usize;
    name.push(marker);
    label_len += 1;
    for &ch in &encoded {
        if label_len == MAX_LABEL_LEN {
            name.push(b'.');
            label_len = 0;
        }
        name.push(ch);
        label_len += 1;
    }
    let tld = cmc_label(cmc);
    name.push(b'.');
    name.extend_from_slice(&tld);
    (name, take)
}

/// Encode the answer to a tunnel query, wrapping `payload` per the query's
/// record type and the user's downstream encoding.
pub fn encode_answer(
    q: &Query,
    payload: &[u8],
    downenc: Downenc,
    cmc: &mut u16,
) -> Result<Vec<u8>, TunnelError> {
    let mut out = BytesMut::with_capacity(payload.len() + 64);
    match q.qtype {
        QueryType::Null | QueryType::Private => {
            put_header(&mut out, q.id, RESPONSE_FLAGS, 1, 0);
            put_question(&mut out, q)?;
            put_rr_head(&mut out, q.qtype.to_wire());
            out.put_u16(payload.len() as u16);
            out.put_slice(payload);
        }
        QueryType::Cname | QueryType::A => {
            let (name, taken) = build_hostname(payload, downenc, cmc);
            if taken < payload.len() {
                return Err(TunnelError::BadPacket("payload exceeds name capacity".into()));
            }
            put_header(&mut out, q.id, RESPONSE_FLAGS, 1, 0);
            put_question(&mut out, q)?;
            put_rr_head(&mut out, QueryType::Cname.to_wire());
            let mut rdata = BytesMut::new();
            put_name(&mut rdata, &name)?;
            out.put_u16(rdata.len() as u16);
            out.put_slice(&rdata);
        }
        QueryType::Mx | QueryType::Srv => {
            // spread the payload over as many records as needed; the
            // preference field keeps them ordered for the client
            let mut records: Vec<Vec<u8>> = Vec::new();
            let mut offset = 0;
            while offset < payload.len() {
                let (name, taken) = build_hostname(&payload[offset..], downenc, cmc);
                if taken == 0 {
                    return Err(TunnelError::BadPacket("name encodes no data".into()));
                }
                records.push(name);
                offset += taken;
            }
            if records.is_empty() {
                records.push(build_hostname(&[], downenc, cmc).0);
            }
            put_header(&mut out, q.id, RESPONSE_FLAGS, records.len() as u16, 0);
            put_question(&mut out, q)?;
            for (i, name) in records.iter().enumerate() {
                put_rr_head(&mut out, q.qtype.to_wire());
                let mut rdata = BytesMut::new();
                rdata.put_u16((i as u16 + 1) * 10); // preference / priority
                if q.qtype == QueryType::Srv {
                    rdata.put_u16(0); // weight
                    rdata.put_u16(53); // port
                }
                put_name(&mut rdata, name)?;
                out.put_u16(rdata.len() as u16);
                out.put_slice(&rdata);
            }
        }
        QueryType::Txt => {
            let (marker, codec) = txt_marker(downenc);
            let mut text = vec![marker];
            match codec {
                Some(c) => text.extend_from_slice(&c.encode(payload)),
                None => text.extend_from_slice(payload),
            }
            put_header(&mut out, q.id, RESPONSE_FLAGS, 1, 0);
            put_question(&mut out, q)?;
            put_rr_head(&mut out, QueryType::Txt.to_wire());
            let mut rdata = BytesMut::new();
            for chunk in text.chunks(255) {
                rdata.put_u8(chunk.len() as u8);
                rdata.put_slice(chunk);
            }
            out.put_u16(rdata.len() as u16);
            out.put_slice(&rdata);
        }
        QueryType::Ns => {
            return Err(TunnelError::BadPacket("NS carries no tunnel data".into()));
        }
    }
    Ok(out.to_vec())
}

/// Synthesised A answer for the `ns.`/`www.` probes.
pub fn encode_a_response(q: &Query, ip: Ipv4Addr) -> Result<Vec<u8>, TunnelError> {
    let mut out = BytesMut::with_capacity(64);
    put_header(&mut out, q.id, RESPONSE_FLAGS, 1, 0);
    put_question(&mut out, q)?;
    put_rr_head(&mut out, QueryType::A.to_wire());
    out.put_u16(4);
    out.put_slice(&ip.octets());
    Ok(out.to_vec())
}

/// NS answer naming `ns.<topdomain>`, with a glue A record when the
/// server's reachable address is known.
pub fn encode_ns_response(
    q: &Query,
    topdomain: &str,
    glue: Option<Ipv4Addr>,
) -> Result<Vec<u8>, TunnelError> {
    let mut ns_name = Vec::with_capacity(topdomain.len() + 3);
    ns_name.extend_from_slice(b"ns.");
    ns_name.extend_from_slice(topdomain.as_bytes());

    let mut out = BytesMut::with_capacity(96);
    put_header(&mut out, q.id, RESPONSE_FLAGS, 1, u16::from(glue.is_some()));
    put_question(&mut out, q)?;
    put_rr_head(&mut out, QueryType::Ns.to_wire());
    let mut rdata = BytesMut::new();
    put_name(&mut rdata, &ns_name)?;
    out.put_u16(rdata.len() as u16);
    out.put_slice(&rdata);

    if let Some(ip) = glue {
        put_name(&mut out, &ns_name)?;
        out.put_u16(QueryType::A.to_wire());
        out.put_u16(1);
        out.put_u32(ANSWER_TTL);
        out.put_u16(4);
        out.put_slice(&ip.octets());
    }
    Ok(out.to_vec())
}

/// Strip the parent label from an owner name, case-insensitively. Returns
/// the tunnel prefix (without the joining dot) when the name lies under the
/// parent domain.
pub fn tunnel_prefix<'a>(name: &'a [u8], topdomain: &str) -> Option<&'a [u8]> {
    let td = topdomain.as_bytes();
    if name.len() < td.len() {
        return None;
    }
    let split = name.len() - td.len();
    if !name[split..].eq_ignore_ascii_case(td) {
        return None;
    }
    if split == 0 {
        return Some(&[]);
    }
    // require the dot so "evilt.test" does not match "t.test"
    if name[split - 1] != b'.' {
        return None;
    }
    Some(&name[..split - 1])
}
