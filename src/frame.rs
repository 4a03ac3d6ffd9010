//! Tunnel frame layer
//!
//! Byte-level framing shared by the dispatcher and scheduler:
//!
//! - downstream data/ping frames carried in DNS answers,
//! - the upstream data header carried in query labels,
//! - the upstream ping header,
//! - the raw-mode UDP header used once a session has upgraded off DNS.
//!
//! All multi-byte fields are big-endian.

use crate::TunnelError;

/// Downstream header without the ping extension.
pub const DOWNSTREAM_HDR: usize = 3;

/// Downstream header with the ping extension (window sizes and bases).
pub const DOWNSTREAM_PING_HDR: usize = 7;

/// Label chars consumed by the upstream data header:
/// slot nibble + CMC char + five base32 chars.
pub const UPSTREAM_HDR: usize = 7;

/// Decoded length of the upstream ping struct.
pub const UPSTREAM_PING_LEN: usize = 9;

const FLAG_END: u8 = 1 << 0;
const FLAG_START: u8 = 1 << 1;
const FLAG_COMPRESSED: u8 = 1 << 2;
const FLAG_ACK: u8 = 1 << 3;
const FLAG_PING: u8 = 1 << 4;
const FLAG_IMMEDIATE: u8 = 1 << 5;

/// Window counters attached to a downstream frame when the ping bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingCounters {
    pub out_winsize: u8,
    pub in_winsize: u8,
    pub out_start_seq: u8,
    pub in_start_seq: u8,
}

/// A downstream data/ping frame as sent inside an answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamFrame {
    /// Sequence id of the carried fragment; 0 for dataless pings.
    pub seq: u8,
    /// Piggybacked ACK of an upstream fragment.
    pub ack: Option<u8>,
    pub compressed: bool,
    pub start: bool,
    pub end: bool,
    /// Answered straight from the dispatcher rather than from parked state.
    pub immediate: bool,
    pub ping: Option<PingCounters>,
}

impl DownstreamFrame {
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let headerlen = if self.ping.is_some() {
            DOWNSTREAM_PING_HDR
        } else {
            DOWNSTREAM_HDR
        };
        let mut out = Vec::with_capacity(headerlen + data.len());
        out.push(self.seq);
        out.push(self.ack.unwrap_or(0));
        let mut flags = 0u8;
        if self.end {
            flags |= FLAG_END;
        }
        if self.start {
            flags |= FLAG_START;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.ack.is_some() {
            flags |= FLAG_ACK;
        }
        if self.ping.is_some() {
            flags |= FLAG_PING;
        }
        if self.immediate {
            flags |= FLAG_IMMEDIATE;
        }
        out.push(flags);
        if let Some(p) = self.ping {
            out.push(p.out_winsize);
            out.push(p.in_winsize);
            out.push(p.out_start_seq);
            out.push(p.in_start_seq);
        }
        out.extend_from_slice(data);
        out
    }

    /// Split a received frame into header and payload.
    pub fn decode(raw: &[u8]) -> Result<(Self, &[u8]), TunnelError> {
        if raw.len() < DOWNSTREAM_HDR {
            return Err(TunnelError::BadPacket("downstream frame too short".into()));
        }
        let flags = raw[2];
        let ping = if flags & FLAG_PING != 0 {
            if raw.len() < DOWNSTREAM_PING_HDR {
                return Err(TunnelError::BadPacket("ping frame too short".into()));
            }
            Some(PingCounters {
                out_winsize: raw[3],
                in_winsize: raw[4],
                out_start_seq: raw[5],
                in_start_seq: raw[6],
            })
        } else {
            None
        };
        let headerlen = if ping.is_some() {
            DOWNSTREAM_PING_HDR
        } else {
            DOWNSTREAM_HDR
        };
        let frame = DownstreamFrame {
            seq: raw[0],
            ack: (flags & FLAG_ACK != 0).then_some(raw[1]),
            compressed: flags & FLAG_COMPRESSED != 0,
            start: flags & FLAG_START != 0,
            end: flags & FLAG_END != 0,
            immediate: flags & FLAG_IMMEDIATE != 0,
            ping,
        };
        Ok((frame, &raw[headerlen..]))
    }
}

/// Header of an upstream data fragment, decoded from five base32 chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamHeader {
    pub seq: u8,
    pub ack: Option<u8>,
    pub compressed: bool,
    pub start: bool,
    pub end: bool,
}

impl UpstreamHeader {
    /// The five base32 chars decode to three bytes: seq, ack, flags.
    /// Flags sit in the top nibble of the third byte.
    pub fn decode(raw: &[u8]) -> Result<Self, TunnelError> {
        if raw.len() < 3 {
            return Err(TunnelError::BadPacket("upstream header too short".into()));
        }
        let flags = raw[2] >> 4;
        Ok(UpstreamHeader {
            seq: raw[0],
            ack: ((flags >> 3) & 1 == 1).then_some(raw[1]),
            compressed: (flags >> 2) & 1 == 1,
            start: (flags >> 1) & 1 == 1,
            end: flags & 1 == 1,
        })
    }

    pub fn encode(&self) -> [u8; 3] {
        let mut flags = 0u8;
        if self.ack.is_some() {
            flags |= 1 << 3;
        }
        if self.compressed {
            flags |= 1 << 2;
        }
        if self.start {
            flags |= 1 << 1;
        }
        if self.end {
            flags |= 1;
        }
        [self.seq, self.ack.unwrap_or(0), flags << 4]
    }
}

/// A decoded upstream ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRequest {
    pub slot: u8,
    pub ack: Option<u8>,
    pub up_winsize: u8,
    pub dn_winsize: u8,
    pub up_seq: u8,
    pub dn_seq: u8,
    pub timeout_ms: u16,
    /// Bit 0: answer this query now instead of parking it.
    pub respond_now: bool,
    /// Bit 3: apply `timeout_ms` as the new per-user query timeout.
    pub apply_timeout: bool,
}

impl PingRequest {
    pub fn decode(raw: &[u8]) -> Result<Self, TunnelError> {
        if raw.len() < UPSTREAM_PING_LEN {
            return Err(TunnelError::BadPacket("ping header too short".into()));
        }
        let flags = raw[8];
        Ok(PingRequest {
            slot: raw[0],
            ack: ((flags >> 2) & 1 == 1).then_some(raw[1]),
            up_winsize: raw[2],
            dn_winsize: raw[3],
            up_seq: raw[4],
            dn_seq: raw[5],
            timeout_ms: u16::from_be_bytes([raw[6], raw[7]]),
            respond_now: flags & 1 == 1,
            apply_timeout: (flags >> 3) & 1 == 1,
        })
    }

    pub fn encode(&self) -> [u8; UPSTREAM_PING_LEN] {
        let mut flags = 0u8;
        if self.respond_now {
            flags |= 1;
        }
        if self.ack.is_some() {
            flags |= 1 << 2;
        }
        if self.apply_timeout {
            flags |= 1 << 3;
        }
        let t = self.timeout_ms.to_be_bytes();
        [
            self.slot,
            self.ack.unwrap_or(0),
            self.up_winsize,
            self.dn_winsize,
            self.up_seq,
            self.dn_seq,
            t[0],
            t[1],
            flags,
        ]
    }
}

/// Raw-mode identification magic.
pub const RAW_IDENT: [u8; 3] = [0x10, 0xD1, 0x9E];

/// Raw-mode header length: magic plus command/slot byte.
pub const RAW_HDR_LEN: usize = 4;

/// Raw-mode commands, packed into the high nibble of the control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCommand {
    Login,
    Data,
    Ping,
}

impl RawCommand {
    fn to_nibble(self) -> u8 {
        match self {
            RawCommand::Login => 0x10,
            RawCommand::Data => 0x20,
            RawCommand::Ping => 0x30,
        }
    }

    fn from_nibble(byte: u8) -> Option<Self> {
        match byte & 0xF0 {
            0x10 => Some(RawCommand::Login),
            0x20 => Some(RawCommand::Data),
            0x30 => Some(RawCommand::Ping),
            _ => None,
        }
    }
}

/// Build a raw-mode packet: magic, command | slot, payload.
pub fn encode_raw(cmd: RawCommand, slot: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RAW_HDR_LEN + payload.len());
    out.extend_from_slice(&RAW_IDENT);
    out.push(cmd.to_nibble() | (slot & 0x0F));
    out.extend_from_slice(payload);
    out
}

/// Recognise a raw-mode packet. `None` means the bytes are not raw-mode
/// traffic and should go through the DNS decoder instead.
pub fn decode_raw(packet: &[u8]) -> Option<(RawCommand, u8, &[u8])> {
    if packet.len() < RAW_HDR_LEN || packet[..RAW_IDENT.len()] != RAW_IDENT {
        return None;
    }
    let control = packet[RAW_IDENT.len()];
    let cmd = RawCommand::from_nibble(control)?;
    Some((cmd, control & 0x0F, &packet[RAW_HDR_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_frame_round_trip() {
        let frame = DownstreamFrame {
            seq: 42,
            ack: Some(7),
            compressed: true,
            start: true,
            end: false,
            immediate: false,
            ping: None,
        };
        let raw = frame.encode(b"payload");
        let (decoded, data) = DownstreamFrame::decode(&raw).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(data, b"payload");
    }

    #[test]
    fn downstream_ping_frame_carries_counters() {
        let frame = DownstreamFrame {
            seq: 0,
            ack: None,
            compressed: false,
            start: false,
            end: false,
            immediate: true,
            ping: Some(PingCounters {
                out_winsize: 8,
                in_winsize: 8,
                out_start_seq: 3,
                in_start_seq: 200,
            }),
        };
        let raw = frame.encode(&[]);
        assert_eq!(raw.len(), DOWNSTREAM_PING_HDR);
        let (decoded, data) = DownstreamFrame::decode(&raw).unwrap();
        assert_eq!(decoded, frame);
        assert!(data.is_empty());
    }

    #[test]
    fn absent_ack_encodes_as_zero_without_flag() {
        let frame = DownstreamFrame {
            seq: 1,
            ack: None,
            compressed: false,
            start: true,
            end: true,
            immediate: false,
            ping: None,
        };
        let raw = frame.encode(b"x");
        assert_eq!(raw[1], 0);
        let (decoded, _) = DownstreamFrame::decode(&raw).unwrap();
        assert_eq!(decoded.ack, None);
    }

    #[test]
    fn upstream_header_round_trip() {
        let hdr = UpstreamHeader {
            seq: 255,
            ack: Some(0),
            compressed: false,
            start: false,
            end: true,
        };
        assert_eq!(UpstreamHeader::decode(&hdr.encode()).unwrap(), hdr);

        let no_ack = UpstreamHeader { ack: None, ..hdr };
        assert_eq!(UpstreamHeader::decode(&no_ack.encode()).unwrap(), no_ack);
    }

    #[test]
    fn ping_request_round_trip() {
        let ping = PingRequest {
            slot: 3,
            ack: Some(99),
            up_winsize: 8,
            dn_winsize: 16,
            up_seq: 250,
            dn_seq: 4,
            timeout_ms: 4000,
            respond_now: true,
            apply_timeout: true,
        };
        assert_eq!(PingRequest::decode(&ping.encode()).unwrap(), ping);
    }

    #[test]
    fn raw_packet_round_trip() {
        let pkt = encode_raw(RawCommand::Data, 0xB, b"ip bytes");
        let (cmd, slot, payload) = decode_raw(&pkt).unwrap();
        assert_eq!(cmd, RawCommand::Data);
        assert_eq!(slot, 0xB);
        assert_eq!(payload, b"ip bytes");
    }

    #[test]
    fn raw_decode_rejects_dns_traffic() {
        // a plausible DNS header must never be mistaken for raw mode
        assert!(decode_raw(&[0x12, 0x34, 0x01, 0x00, 0x00, 0x01]).is_none());
        assert!(decode_raw(&RAW_IDENT).is_none()); // short
        assert!(decode_raw(&[0x10, 0xD1, 0x9E, 0x40]).is_none()); // bad cmd
    }
}
