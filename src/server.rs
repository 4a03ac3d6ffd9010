//! Tunnel server core
//!
//! One task owns everything: the DNS sockets, the user table, the
//! forwarded-query table and the virtual-interface seam. Per iteration the
//! loop works out the soonest moment it owes an answer to some parked
//! query, waits for readiness up to that deadline, drains whichever side
//! became ready, and lets the scheduler flush queries that have become
//! answerable.
//!
//! ```text
//! resolver ──DNS──▶ dispatcher ──▶ per-user state ──▶ virtual interface
//!     ▲                │  (windows, qmem, cache)            │
//!     └──── scheduler ◀┘ ◀────────── outgoing window ◀──────┘
//! ```
//!
//! Handlers never propagate per-query errors; they answer with a protocol
//! reply or drop, and the loop only ends on shutdown or a dead interface
//! seam.

use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use tokio::net::UdpSocket;

use crate::codec::{b32_value, Codec, Downenc};
use crate::config::ServerConfig;
use crate::dns::{self, Query, QueryType};
use crate::frame::{
    self, DownstreamFrame, PingCounters, PingRequest, RawCommand, UpstreamHeader, UPSTREAM_HDR,
    UPSTREAM_PING_LEN,
};
use crate::fwquery::FwQueryTable;
use crate::login::{login_digest, LOGIN_DIGEST_LEN};
use crate::qmem::Append;
use crate::tun::{self, TunHandle};
use crate::users::{ConnType, TunUser, UserTable, MAX_USERS};
use crate::window::Fragment;
use crate::TunnelError;

/// Wire protocol revision; clients offering anything else get a VNAK.
pub const PROTOCOL_VERSION: u32 = 0x0000_0502;

/// Deadline used when no user has pending work.
const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Fixed pattern served by the downstream codec probe: edge octets, both
/// letter cases, and every high-bit stride the codecs must carry intact.
pub const DOWNSTREAM_CODEC_CHECK: [u8; 48] = [
    0x00, 0xFF, 0x00, 0xFF, 0x10, 0x20, 0x41, 0x61, 0x5A, 0x7A, 0x2D, 0x2E, 0x30, 0x39, 0x01,
    0x80, 0x7F, 0xFE, 0xAA, 0x55, 0xCA, 0xFE, 0xBA, 0xBE, 0x0D, 0x0A, 0x09, 0x07, 0xDE, 0xAD,
    0xBE, 0xEF, 0x13, 0x37, 0x42, 0x24, 0x99, 0x66, 0xC3, 0x3C, 0xE0, 0x1F, 0xF8, 0x07, 0xB2,
    0x4D, 0xD2, 0x2B,
];

enum Event {
    Dns { packet: Vec<u8>, from: SocketAddr, v6: bool },
    ForwardReply { packet: Vec<u8> },
    TunPacket(Option<Vec<u8>>),
    Timeout,
}

/// The server context: every piece of state the original kept process-wide.
pub struct Server {
    config: ServerConfig,
    sock_v4: UdpSocket,
    sock_v6: Option<UdpSocket>,
    forward_sock: Option<UdpSocket>,
    tun: TunHandle,
    users: UserTable,
    fwq: FwQueryTable,
    /// Rotating counter feeding the answer-name pseudo-TLD.
    cmc: u16,
    running: bool,
    started: Instant,
}

impl Server {
    /// Bind sockets and build the server context.
    pub async fn bind(config: ServerConfig, tun: TunHandle) -> Result<Self, TunnelError> {
        config.validate().map_err(TunnelError::Config)?;
        let sock_v4 = UdpSocket::bind(config.listen).await?;
        log::info!("DNS listener on {}", sock_v4.local_addr()?);
        let sock_v6 = match config.listen_v6 {
            Some(addr) => {
                let sock = UdpSocket::bind(addr).await?;
                log::info!("DNS listener on {}", sock.local_addr()?);
                Some(sock)
            }
            None => None,
        };
        let forward_sock = match config.forward_port {
            Some(port) => {
                let sock = UdpSocket::bind("127.0.0.1:0").await?;
                log::info!(
                    "forwarding non-tunnel queries to 127.0.0.1:{port} via {}",
                    sock.local_addr()?
                );
                Some(sock)
            }
            None => None,
        };
        let users = UserTable::new(config.tun_ip, config.netmask, config.check_client_ip);
        Ok(Server {
            config,
            sock_v4,
            sock_v6,
            forward_sock,
            tun,
            users,
            fwq: FwQueryTable::new(),
            cmc: 0,
            running: true,
            started: Instant::now(),
        })
    }

    /// Address of the IPv4 DNS socket, mainly for tests binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.sock_v4.local_addr()?)
    }

    /// Run until shutdown (idle bound reached or interface seam closed).
    pub async fn run(mut self) -> Result<(), TunnelError> {
        let mut buf4 = vec![0u8; 65536];
        let mut buf6 = vec![0u8; 65536];
        let mut buf_fw = vec![0u8; 65536];

        while self.running {
            let wait = self.scheduler_pass().await;

            let event = {
                let sock_v4 = &self.sock_v4;
                let sock_v6 = self.sock_v6.as_ref();
                let forward = self.forward_sock.as_ref();
                let tun_rx = &mut self.tun.rx;
                tokio::select! {
                    r = sock_v4.recv_from(&mut buf4) => match r {
                        Ok((n, from)) => Event::Dns { packet: buf4[..n].to_vec(), from, v6: false },
                        Err(e) => { log::warn!("dns recv: {e}"); continue; }
                    },
                    r = async { sock_v6.unwrap().recv_from(&mut buf6).await }, if sock_v6.is_some() => match r {
                        Ok((n, from)) => Event::Dns { packet: buf6[..n].to_vec(), from, v6: true },
                        Err(e) => { log::warn!("dns6 recv: {e}"); continue; }
                    },
                    r = async { forward.unwrap().recv(&mut buf_fw).await }, if forward.is_some() => match r {
                        Ok(n) => Event::ForwardReply { packet: buf_fw[..n].to_vec() },
                        Err(e) => { log::warn!("forward recv: {e}"); continue; }
                    },
                    pkt = tun_rx.recv() => Event::TunPacket(pkt),
                    _ = tokio::time::sleep(wait) => Event::Timeout,
                }
            };

            match event {
                Event::Dns { packet, from, v6 } => self.handle_dns_packet(&packet, from, v6).await,
                Event::ForwardReply { packet } => self.handle_forward_reply(&packet).await,
                Event::TunPacket(Some(packet)) => self.handle_tun_packet(packet).await,
                Event::TunPacket(None) => {
                    log::info!("virtual interface closed, shutting down");
                    self.running = false;
                }
                Event::Timeout => self.check_idle(),
            }
        }
        Ok(())
    }

    fn check_idle(&mut self) {
        let Some(max_idle) = self.config.max_idle else {
            return;
        };
        let last_action = self.users.last_action().unwrap_or(self.started);
        if last_action.elapsed() > max_idle {
            log::warn!("server idle for too long, shutting down");
            self.running = false;
        }
    }

    fn sock_for(&self, addr: &SocketAddr) -> &UdpSocket {
        match (addr, &self.sock_v6) {
            (SocketAddr::V6(_), Some(sock)) => sock,
            _ => &self.sock_v4,
        }
    }

    /// Arrival address for a query, as far as we can know it without
    /// platform ancillary data: the advertised address, else the socket's
    /// bound address when specific.
    fn arrival_destination(&self, v6: bool) -> Option<IpAddr> {
        if let Some(ip) = self.config.external_ip {
            return Some(IpAddr::V4(ip));
        }
        let sock = if v6 {
            self.sock_v6.as_ref()?
        } else {
            &self.sock_v4
        };
        let ip = sock.local_addr().ok()?.ip();
        (!ip.is_unspecified()).then_some(ip)
    }

    async fn send_udp(&self, sock: &UdpSocket, payload: &[u8], to: SocketAddr) {
        if let Err(e) = sock.send_to(payload, to).await {
            log::warn!("send to {to}: {e}");
        }
    }

    /// Encode `payload` as the answer to `q` and send it to the requester.
    async fn write_dns(&mut self, q: &Query, payload: &[u8], downenc: Downenc) {
        let answer = match dns::encode_answer(q, payload, downenc, &mut self.cmc) {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("answer for '{}' does not fit: {e}", q.name_utf8());
                return;
            }
        };
        log::debug!(
            "TX: client {} id {:5} {} bytes data, type {:?}",
            q.from,
            q.id,
            payload.len(),
            q.qtype
        );
        self.send_udp(self.sock_for(&q.from), &answer, q.from).await;
    }

    // ------------------------------------------------------------------
    // inbound DNS
    // ------------------------------------------------------------------

    async fn handle_dns_packet(&mut self, packet: &[u8], from: SocketAddr, v6: bool) {
        if let Some((cmd, slot, payload)) = frame::decode_raw(packet) {
            self.handle_raw(cmd, slot, payload, from).await;
            return;
        }

        let destination = self.arrival_destination(v6);
        let q = match dns::parse_query(packet, from, destination) {
            Ok(q) => q,
            Err(e) => {
                log::debug!("unparseable packet from {from}: {e}");
                return;
            }
        };
        log::debug!(
            "RX: client {} id {:5} type {:?} name {}",
            q.from,
            q.id,
            q.qtype,
            q.name_utf8()
        );

        let Some(prefix) = dns::tunnel_prefix(&q.name, &self.config.topdomain) else {
            self.forward_query(&q, packet).await;
            return;
        };
        let prefix = prefix.to_vec();

        // probes any resolver may send against the zone itself
        if q.qtype == QueryType::A && prefix.eq_ignore_ascii_case(b"ns") {
            let ip = match (self.config.external_ip, q.destination) {
                (Some(ip), _) => ip,
                (None, Some(IpAddr::V4(ip))) => ip,
                _ => Ipv4Addr::LOCALHOST,
            };
            self.answer_a(&q, ip).await;
            return;
        }
        if q.qtype == QueryType::A && prefix.eq_ignore_ascii_case(b"www") {
            self.answer_a(&q, Ipv4Addr::LOCALHOST).await;
            return;
        }
        if q.qtype == QueryType::Ns {
            self.answer_ns(&q).await;
            return;
        }

        self.handle_tunnel_request(q, &prefix).await;
    }

    async fn answer_a(&mut self, q: &Query, ip: Ipv4Addr) {
        match dns::encode_a_response(q, ip) {
            Ok(answer) => self.send_udp(self.sock_for(&q.from), &answer, q.from).await,
            Err(e) => log::warn!("a response: {e}"),
        }
    }

    async fn answer_ns(&mut self, q: &Query) {
        let glue = match (self.config.external_ip, q.destination) {
            (Some(ip), _) => Some(ip),
            (None, Some(IpAddr::V4(ip))) => Some(ip),
            _ => None,
        };
        match dns::encode_ns_response(q, &self.config.topdomain, glue) {
            Ok(answer) => self.send_udp(self.sock_for(&q.from), &answer, q.from).await,
            Err(e) => log::warn!("ns response: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // command dispatch
    // ------------------------------------------------------------------

    async fn handle_tunnel_request(&mut self, q: Query, prefix: &[u8]) {
        if prefix.len() < 2 {
            return;
        }
        // label dots carry no information; strip them so header fields sit
        // at fixed offsets regardless of label splits
        let data: Vec<u8> = prefix.iter().copied().filter(|&b| b != b'.').collect();
        if data.len() < 2 {
            return;
        }

        match data[0].to_ascii_uppercase() {
            b'V' => self.cmd_version(&q, &data).await,
            b'L' => self.cmd_login(&q, &data).await,
            b'I' => self.cmd_ip_probe(&q, &data).await,
            b'Z' => self.write_dns(&q, prefix, Downenc::Base32).await,
            b'S' => self.cmd_switch_codec(&q, &data).await,
            b'O' => self.cmd_options(&q, &data).await,
            b'Y' => self.cmd_downstream_codec_check(&q, &data).await,
            b'R' => self.cmd_fragsize_probe(&q, &data).await,
            b'N' => self.cmd_set_fragsize(&q, &data).await,
            b'P' => self.cmd_ping(&q, &data).await,
            c if c.is_ascii_hexdigit() => self.cmd_upstream_data(&q, &data).await,
            c => log::debug!("unknown command {:?} from {}", c as char, q.from),
        }
    }

    fn decode_b32(&self, data: &[u8]) -> Vec<u8> {
        Codec::Base32.decode(data).unwrap_or_default()
    }

    async fn cmd_version(&mut self, q: &Query, data: &[u8]) {
        let unpacked = self.decode_b32(&data[1..]);
        let version = if unpacked.len() >= 4 {
            u32::from_be_bytes([unpacked[0], unpacked[1], unpacked[2], unpacked[3]])
        } else {
            !PROTOCOL_VERSION // malformed greeting gets a VNAK
        };

        if version != PROTOCOL_VERSION {
            log::info!(
                "dropped user from {}, sent bad version {version:08X}",
                q.from
            );
            self.send_version_response(q, b"VNAK", PROTOCOL_VERSION, 0, Downenc::Base32)
                .await;
            return;
        }

        let Some(slot) = self.users.find_available() else {
            log::info!("dropped user from {}, server full", q.from);
            let count = self.users.active_count() as u32;
            self.send_version_response(q, b"VFUL", count, 0, Downenc::Base32)
                .await;
            return;
        };

        let seed = rand::random::<u32>();
        let downenc = if q.qtype.is_binary() {
            Downenc::Raw
        } else {
            Downenc::Base32
        };
        let user = TunUser::new(
            slot,
            seed,
            self.users.tunnel_ip(slot),
            q.from,
            downenc,
            self.config.default_query_timeout,
            self.config.dedup_ignore_case,
        );
        self.users.insert(user);
        log::info!("accepted version for user #{slot} from {}", q.from);
        self.send_version_response(q, b"VACK", seed, slot, downenc).await;
    }

    async fn send_version_response(
        &mut self,
        q: &Query,
        tag: &[u8; 4],
        payload: u32,
        slot: u8,
        downenc: Downenc,
    ) {
        let mut out = [0u8; 9];
        out[..4].copy_from_slice(tag);
        out[4..8].copy_from_slice(&payload.to_be_bytes());
        out[8] = slot;
        self.write_dns(q, &out, downenc).await;
    }

    async fn cmd_login(&mut self, q: &Query, data: &[u8]) {
        let unpacked = self.decode_b32(&data[1..]);
        if unpacked.len() < 1 + LOGIN_DIGEST_LEN {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let slot = unpacked[0];
        if !self.users.check_user_and_ip(slot, &q.from) {
            log::warn!("dropped login for user #{slot} from {}", q.from);
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }

        let (seed, tun_ip, downenc) = {
            let user = self.users.get_mut(slot).expect("checked above");
            user.touch();
            (user.seed, user.tun_ip, user.downenc)
        };
        let expected = login_digest(&self.config.password, seed);
        if unpacked[1..1 + LOGIN_DIGEST_LEN] != expected {
            log::warn!("rejected login for user #{slot} from {}, bad password", q.from);
            self.write_dns(q, b"LNAK", Downenc::Base32).await;
            return;
        }

        self.users.get_mut(slot).expect("checked above").authenticated = true;
        let reply = format!(
            "{}-{}-{}-{}",
            self.users.server_ip(),
            tun_ip,
            self.config.mtu,
            self.users.netmask()
        );
        log::info!("accepted password from user #{slot}, given IP {tun_ip}");
        self.write_dns(q, reply.as_bytes(), downenc).await;
    }

    async fn cmd_ip_probe(&mut self, q: &Query, data: &[u8]) {
        let Some(slot) = b32_value(data[1]) else {
            return;
        };
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        let mut reply = vec![b'I'];
        match q.destination {
            Some(IpAddr::V4(ip)) => reply.extend_from_slice(&ip.octets()),
            Some(IpAddr::V6(ip)) => reply.extend_from_slice(&ip.octets()),
            None => reply.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets()),
        }
        self.write_dns(q, &reply, Downenc::Base32).await;
    }

    async fn cmd_switch_codec(&mut self, q: &Query, data: &[u8]) {
        if data.len() < 3 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let Some(slot) = b32_value(data[1]) else {
            return;
        };
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        let downenc = self.users.get(slot).expect("checked").downenc;
        match b32_value(data[2]).and_then(Codec::from_selector) {
            Some(codec) => {
                self.users.get_mut(slot).expect("checked").codec = codec;
                log::info!("user #{slot} upstream codec {}", codec.name());
                self.write_dns(q, codec.name().as_bytes(), downenc).await;
            }
            None => self.write_dns(q, b"BADCODEC", downenc).await,
        }
    }

    async fn cmd_options(&mut self, q: &Query, data: &[u8]) {
        if data.len() < 7 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let Some(slot) = b32_value(data[1]) else {
            return;
        };
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        let numopts = (data[2] as char).to_digit(10).unwrap_or(0) as usize;
        if numopts == 0 || numopts > 9 || data.len() < numopts + 6 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }

        // parse into temporaries; nothing changes unless all options are valid
        let user = self.users.get(slot).expect("checked");
        let mut lazy = user.lazy;
        let mut compression = user.down_compression;
        let mut downenc = user.downenc;
        let old_downenc = user.downenc;
        let mut picked_codec = false;

        let opts = &data[3..3 + numopts];
        for &opt in opts {
            match opt.to_ascii_uppercase() {
                b'T' | b'S' | b'U' | b'V' | b'R' => {
                    downenc = Downenc::from_option(opt).expect("matched letter");
                    picked_codec = true;
                }
                b'L' => lazy = true,
                b'I' => lazy = false,
                b'C' => compression = true,
                b'D' => compression = false,
                _ => {
                    self.write_dns(q, b"BADCODEC", old_downenc).await;
                    return;
                }
            }
        }

        // NULL/PRIVATE sessions default to raw framing when no codec named
        if q.qtype.is_binary() && !picked_codec {
            downenc = Downenc::Raw;
            picked_codec = true;
        }

        let user = self.users.get_mut(slot).expect("checked");
        user.lazy = lazy;
        user.down_compression = compression;
        if picked_codec {
            user.downenc = downenc;
            let fragsize = user.fragsize;
            user.apply_fragsize(fragsize);
        }
        log::debug!(
            "user #{slot} options: lazy {lazy}, compression {compression}, downenc {:?}",
            downenc
        );
        let echo = opts.to_vec();
        self.write_dns(q, &echo, downenc).await;
    }

    async fn cmd_downstream_codec_check(&mut self, q: &Query, data: &[u8]) {
        if data.len() < 4 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        if b32_value(data[2]) != Some(1) {
            // only check variant 1 exists
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let requested = Downenc::from_option(data[1]);
        let allowed = match requested {
            Some(Downenc::Raw) => matches!(q.qtype, QueryType::Null | QueryType::Txt),
            Some(_) => matches!(
                q.qtype,
                QueryType::Txt | QueryType::Srv | QueryType::Mx | QueryType::Cname | QueryType::A
            ),
            None => false,
        };
        if allowed {
            self.write_dns(q, &DOWNSTREAM_CODEC_CHECK, requested.expect("allowed"))
                .await;
        } else {
            self.write_dns(q, b"BADCODEC", Downenc::Base32).await;
        }
    }

    async fn cmd_fragsize_probe(&mut self, q: &Query, data: &[u8]) {
        if data.len() < 16 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let unpacked = self.decode_b32(&data[1..6]);
        if unpacked.len() < 3 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let slot = unpacked[0];
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        let downenc = self.users.get(slot).expect("checked").downenc;
        let req = u16::from_be_bytes([unpacked[1], unpacked[2]]);
        if !(2..=2047).contains(&req) {
            self.write_dns(q, b"BADFRAG", downenc).await;
            return;
        }
        log::debug!("fragsize probe from user #{slot}, {req} bytes");

        // checkable pseudo-random pattern: fixed first step, then a
        // constant stride from a random start
        let mut buf = vec![0u8; req as usize];
        buf[0] = (req >> 8) as u8;
        buf[1] = (req & 0xFF) as u8;
        if buf.len() > 2 {
            buf[2] = 107;
        }
        let mut v: u8 = rand::random();
        for byte in buf.iter_mut().skip(3) {
            v = v.wrapping_add(107);
            *byte = v;
        }
        self.write_dns(q, &buf, downenc).await;
    }

    async fn cmd_set_fragsize(&mut self, q: &Query, data: &[u8]) {
        let unpacked = self.decode_b32(&data[1..]);
        if unpacked.len() < 3 {
            self.write_dns(q, b"BADLEN", Downenc::Base32).await;
            return;
        }
        let slot = unpacked[0];
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        let fragsize = u16::from_be_bytes([unpacked[1], unpacked[2]]);
        let downenc = self.users.get(slot).expect("checked").downenc;
        if fragsize < 2 {
            self.write_dns(q, b"BADFRAG", downenc).await;
            return;
        }
        self.users
            .get_mut(slot)
            .expect("checked")
            .apply_fragsize(fragsize);
        self.write_dns(q, &unpacked[1..3], downenc).await;
    }

    async fn cmd_ping(&mut self, q: &Query, data: &[u8]) {
        // id 0 is the cache's vacancy sentinel; resolvers rewrite ids, so
        // dropping costs one query in 64k and the retransmit succeeds
        if q.id == 0 {
            return;
        }
        let unpacked = self.decode_b32(&data[1..]);
        if unpacked.len() < UPSTREAM_PING_LEN {
            log::debug!("invalid ping, length {}", unpacked.len());
            return;
        }
        let ping = match PingRequest::decode(&unpacked) {
            Ok(ping) => ping,
            Err(e) => {
                log::debug!("ping decode: {e}");
                return;
            }
        };
        let slot = ping.slot;
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        if self.replay_cached_answer(slot, q).await {
            return;
        }
        match self.users.get_mut(slot).expect("checked").qmem.append(q) {
            Append::Duplicate => {
                self.write_dns(q, b"x", Downenc::Base32).await;
                return;
            }
            Append::Full => return,
            Append::Parked => {}
        }

        if ping.apply_timeout {
            self.users.get_mut(slot).expect("checked").dns_timeout =
                Duration::from_millis(ping.timeout_ms as u64);
        }
        log::debug!(
            "ping from user #{slot}, down {}/{}, up {}/{}, ack {:?}, timeout {} ms",
            ping.dn_seq,
            ping.dn_winsize,
            ping.up_seq,
            ping.up_winsize,
            ping.ack,
            ping.timeout_ms
        );

        self.process_user_traffic(slot, ping.ack).await;

        let lazy = {
            let user = self.users.get_mut(slot).expect("checked");
            user.send_ping_next = ping.respond_now;
            user.lazy
        };
        if !lazy {
            // immediate mode answers straight away instead of parking
            self.answer_parked_query(slot, q, true, true, true).await;
        }
    }

    async fn cmd_upstream_data(&mut self, q: &Query, data: &[u8]) {
        if data.len() < UPSTREAM_HDR + 1 {
            return;
        }
        if q.id == 0 {
            log::debug!("dropped data query with id 0");
            return;
        }
        let slot = match data[0] {
            c @ b'0'..=b'9' => c - b'0',
            c @ b'a'..=b'f' => c - b'a' + 10,
            c @ b'A'..=b'F' => c - b'A' + 10,
            _ => return,
        };
        if !self.users.check_authenticated_user_and_ip(slot, &q.from) {
            self.write_dns(q, b"BADIP", Downenc::Base32).await;
            return;
        }
        if self.replay_cached_answer(slot, q).await {
            return;
        }
        match self.users.get_mut(slot).expect("checked").qmem.append(q) {
            Append::Duplicate => {
                self.write_dns(q, b"x", Downenc::Base32).await;
                return;
            }
            Append::Full => return,
            Append::Parked => {}
        }

        // data[1] is the client monotonic counter, opaque on purpose
        let header_raw = self.decode_b32(&data[2..UPSTREAM_HDR]);
        let header = match UpstreamHeader::decode(&header_raw) {
            Ok(header) => header,
            Err(e) => {
                log::debug!("upstream header: {e}");
                return;
            }
        };
        let user = self.users.get_mut(slot).expect("checked");
        let payload = match user.codec.decode(&data[UPSTREAM_HDR..]) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("upstream payload from user #{slot}: {e}");
                return;
            }
        };
        log::debug!(
            "frag seq {:3} len {:5} ack {:?} comp {} s{} e{} from user #{slot}",
            header.seq,
            payload.len(),
            header.ack,
            header.compressed as u8,
            header.start as u8,
            header.end as u8
        );

        if let Some(stale) = user.next_upstream_ack {
            // should have been reset when the last frame went out
            log::warn!("next_upstream_ack still {stale} for user #{slot}");
        }
        let fragment = Fragment::new(
            header.seq,
            payload,
            header.compressed,
            header.start,
            header.end,
        );
        user.next_upstream_ack = Some(user.incoming.process_incoming_fragment(fragment));

        self.process_user_traffic(slot, header.ack).await;

        if !self.users.get(slot).expect("checked").lazy {
            self.answer_parked_query(slot, q, false, true, true).await;
        }
        // lazy mode: the ACK rides on a frame chosen by the scheduler
    }

    /// Replay a byte-identical previous answer for a retransmitted query.
    async fn replay_cached_answer(&mut self, slot: u8, q: &Query) -> bool {
        let user = self.users.get(slot).expect("checked");
        let Some(answer) = user.cache.lookup(q) else {
            return false;
        };
        let answer = answer.to_vec();
        let downenc = user.downenc;
        log::debug!("answering user #{slot} '{}' from cache", q.name_utf8());
        self.write_dns(q, &answer, downenc).await;
        true
    }

    /// ACK bookkeeping plus upstream reassembly for one user.
    async fn process_user_traffic(&mut self, slot: u8, ack: Option<u8>) {
        let user = self.users.get_mut(slot).expect("checked");
        if let Some(ack) = ack {
            user.outgoing.ack(ack);
        }
        user.outgoing.tick();
        let reassembled = user.incoming.reassemble();
        user.incoming.tick();
        user.touch();
        if let Some((packet, compressed)) = reassembled {
            self.route_full_packet(slot, packet, compressed).await;
        }
    }

    // ------------------------------------------------------------------
    // datagram routing
    // ------------------------------------------------------------------

    /// A complete IP datagram arrived from a user: hand it to the virtual
    /// interface, or short-circuit it onto another user's downstream.
    async fn route_full_packet(&mut self, from_slot: u8, packet: Vec<u8>, compressed: bool) {
        let (raw, original) = if compressed {
            match decompress(&packet) {
                Ok(raw) => (raw, Some(packet)),
                Err(e) => {
                    log::debug!("discarded datagram from user #{from_slot}: {e}");
                    return;
                }
            }
        } else {
            (packet, None)
        };

        let target = tun::ipv4_destination(&raw).and_then(|ip| self.users.find_by_tun_ip(ip));
        match target {
            None => {
                log::debug!("{} bytes from user #{from_slot} to interface", raw.len());
                if self.tun.tx.send(raw).await.is_err() {
                    log::warn!("virtual interface dropped a datagram");
                }
            }
            Some(to_slot) => {
                log::debug!("{} bytes user #{from_slot} -> user #{to_slot}", raw.len());
                let wants_compressed =
                    self.users.get(to_slot).is_some_and(|u| u.down_compression);
                match original {
                    // keep the already-compressed bytes when the target
                    // would recompress anyway
                    Some(packet) if wants_compressed => {
                        self.enqueue_user_data(to_slot, packet, true).await
                    }
                    _ => self.enqueue_user_data(to_slot, raw, false).await,
                }
            }
        }
    }

    /// A datagram read from the virtual interface: queue it to the user
    /// owning the destination address.
    async fn handle_tun_packet(&mut self, packet: Vec<u8>) {
        let Some(slot) = tun::ipv4_destination(&packet).and_then(|ip| self.users.find_by_tun_ip(ip))
        else {
            return;
        };
        log::debug!("{} byte datagram from interface to user #{slot}", packet.len());
        self.enqueue_user_data(slot, packet, false).await;
    }

    /// Match compression to the user's setting and queue (DNS sessions) or
    /// transmit immediately (raw sessions).
    async fn enqueue_user_data(&mut self, slot: u8, data: Vec<u8>, compressed: bool) {
        let Some(user) = self.users.get(slot) else {
            return;
        };
        let (want, conn, host) = (user.down_compression, user.conn, user.host);
        let (data, compressed) = match (want, compressed) {
            (true, false) => (compress(&data), true),
            (false, true) => match decompress(&data) {
                Ok(raw) => (raw, false),
                Err(e) => {
                    log::debug!("uncompress for user #{slot}: {e}");
                    return;
                }
            },
            _ => (data, compressed),
        };

        match conn {
            ConnType::DnsNull => {
                let user = self.users.get_mut(slot).expect("checked");
                if !user.outgoing.add_outgoing(&data, compressed) {
                    log::debug!("outgoing window full for user #{slot}, datagram dropped");
                }
                user.outgoing.tick();
            }
            ConnType::RawUdp => {
                let packet = frame::encode_raw(RawCommand::Data, slot, &data);
                self.send_udp(self.sock_for(&host), &packet, host).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // raw-mode fast path
    // ------------------------------------------------------------------

    async fn handle_raw(&mut self, cmd: RawCommand, slot: u8, payload: &[u8], from: SocketAddr) {
        log::debug!("raw {:?} from {from}, user #{slot}, {} bytes", cmd, payload.len());
        match cmd {
            RawCommand::Login => self.handle_raw_login(slot, payload, from).await,
            RawCommand::Data => self.handle_raw_data(slot, payload, from).await,
            RawCommand::Ping => self.handle_raw_ping(slot, from).await,
        }
    }

    async fn handle_raw_login(&mut self, slot: u8, payload: &[u8], from: SocketAddr) {
        if payload.len() < LOGIN_DIGEST_LEN {
            return;
        }
        // the source address legitimately differs here: the client probes
        // whether a direct UDP path exists, so only the password gate and
        // slot validity apply
        let Some(user) = self.users.get(slot) else {
            return;
        };
        if !user.authenticated {
            return;
        }
        let expected = login_digest(&self.config.password, user.seed.wrapping_add(1));
        if payload[..LOGIN_DIGEST_LEN] != expected {
            return;
        }

        let reply_digest = login_digest(&self.config.password, user.seed.wrapping_sub(1));
        let user = self.users.get_mut(slot).expect("checked");
        user.touch();
        user.host = from;
        user.conn = ConnType::RawUdp;
        user.authenticated_raw = true;
        log::info!("user #{slot} switched to raw UDP from {from}");

        let packet = frame::encode_raw(RawCommand::Login, slot, &reply_digest);
        self.send_udp(self.sock_for(&from), &packet, from).await;
    }

    async fn handle_raw_data(&mut self, slot: u8, payload: &[u8], from: SocketAddr) {
        if !self.users.check_authenticated_user_and_ip(slot, &from) {
            return;
        }
        if !self.users.get(slot).expect("checked").authenticated_raw {
            return;
        }
        self.users.get_mut(slot).expect("checked").touch();
        // raw data is always zlib-compressed on the wire
        self.route_full_packet(slot, payload.to_vec(), true).await;
    }

    async fn handle_raw_ping(&mut self, slot: u8, from: SocketAddr) {
        if !self.users.check_authenticated_user_and_ip(slot, &from) {
            return;
        }
        if !self.users.get(slot).expect("checked").authenticated_raw {
            return;
        }
        self.users.get_mut(slot).expect("checked").touch();
        let packet = frame::encode_raw(RawCommand::Ping, slot, &[]);
        self.send_udp(self.sock_for(&from), &packet, from).await;
    }

    // ------------------------------------------------------------------
    // forwarding
    // ------------------------------------------------------------------

    /// Relay a non-tunnel query to the sibling resolver, or drop it.
    async fn forward_query(&mut self, q: &Query, packet: &[u8]) {
        let (Some(sock), Some(port)) = (&self.forward_sock, self.config.forward_port) else {
            log::debug!("dropped query outside parent domain: {}", q.name_utf8());
            return;
        };
        self.fwq.put(q.id, q.from);
        let target = SocketAddr::from(([127, 0, 0, 1], port));
        if let Err(e) = sock.send_to(packet, target).await {
            log::warn!("forward query: {e}");
        }
    }

    async fn handle_forward_reply(&mut self, packet: &[u8]) {
        let Some(id) = dns::query_id(packet) else {
            return;
        };
        let Some(addr) = self.fwq.take(id) else {
            log::debug!("lost requester of forwarded id {id}, reply dropped");
            return;
        };
        self.send_udp(self.sock_for(&addr), packet, addr).await;
    }

    // ------------------------------------------------------------------
    // scheduler
    // ------------------------------------------------------------------

    /// Answer every parked query that is due and return how long the loop
    /// may wait before the next one times out.
    async fn scheduler_pass(&mut self) -> Duration {
        let mut soonest = DEFAULT_WAIT;
        for slot in 0..MAX_USERS as u8 {
            let quota = {
                let Some(user) = self.users.get(slot) else {
                    continue;
                };
                if user.qmem.num_pending() == 0 || !user.lazy {
                    continue;
                }
                let mut quota = user.outgoing.sending();
                if user.qmem.num_pending() > user.outgoing.windowsize() {
                    // answer excess queries even without data, so the
                    // resolver's outstanding-query budget is recycled
                    quota = quota.max(user.qmem.num_pending() - user.outgoing.windowsize());
                }
                quota
            };

            let mut sending = quota;
            loop {
                let now = Instant::now();
                let decision = {
                    let Some(user) = self.users.get(slot) else {
                        break;
                    };
                    let Some(q) = user.qmem.next_response() else {
                        break;
                    };
                    let deadline = q.time_recv + user.dns_timeout;
                    let due = sending > 0
                        || now >= deadline
                        || user.next_upstream_ack.is_some()
                        || user.send_ping_next;
                    if due {
                        Some((q, user.send_ping_next))
                    } else {
                        // queries are in arrival order, so the first
                        // non-due one is this user's soonest deadline
                        soonest = soonest.min(deadline - now);
                        None
                    }
                };
                let Some((q, ping)) = decision else {
                    break;
                };
                self.answer_parked_query(slot, &q, ping, true, false).await;
                let user = self.users.get_mut(slot).expect("still live");
                user.send_ping_next = false;
                sending = sending.saturating_sub(1);
            }
        }
        soonest
    }

    /// Answer a parked query with the next sendable fragment, or with a
    /// dataless ping frame. With `respond_now` unset and nothing to say,
    /// the query stays parked.
    async fn answer_parked_query(
        &mut self,
        slot: u8,
        q: &Query,
        ping: bool,
        respond_now: bool,
        immediate: bool,
    ) {
        let (payload, downenc) = {
            let Some(user) = self.users.get_mut(slot) else {
                return;
            };
            user.outgoing.tick();

            let mut pending_ack = user.next_upstream_ack.take();
            let fragment = user.outgoing.next_sending_fragment(&mut pending_ack);

            let counters = PingCounters {
                out_winsize: user.outgoing.windowsize() as u8,
                in_winsize: user.incoming.windowsize() as u8,
                out_start_seq: user.outgoing.start_seq(),
                in_start_seq: user.incoming.start_seq(),
            };

            let (frame, data) = match fragment {
                None => {
                    if user.lazy && !respond_now {
                        // nothing to say yet; keep the query parked and
                        // keep owing the ACK
                        user.next_upstream_ack = pending_ack;
                        return;
                    }
                    let frame = DownstreamFrame {
                        seq: 0,
                        ack: pending_ack,
                        compressed: false,
                        start: false,
                        end: false,
                        immediate,
                        ping: Some(counters),
                    };
                    (frame, Vec::new())
                }
                Some(f) => {
                    let frame = DownstreamFrame {
                        seq: f.seq,
                        ack: f.ack_other,
                        compressed: f.compressed,
                        start: f.start,
                        end: f.end,
                        immediate,
                        ping: ping.then_some(counters),
                    };
                    (frame, f.data)
                }
            };
            (frame.encode(&data), user.downenc)
        };

        self.write_dns(q, &payload, downenc).await;

        let user = self.users.get_mut(slot).expect("still live");
        user.cache.store(q, &payload);
        user.qmem.answered();
        user.outgoing.tick();
    }
}

fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    // writing into a Vec cannot fail
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(data)?;
    decoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_round_trip() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbcc".repeat(20);
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress(b"not a zlib stream").is_err());
    }

    #[test]
    fn codec_check_pattern_is_stable() {
        // clients verify this vector byte-for-byte; it must never drift
        assert_eq!(DOWNSTREAM_CODEC_CHECK.len(), 48);
        assert_eq!(DOWNSTREAM_CODEC_CHECK[0], 0x00);
        assert_eq!(DOWNSTREAM_CODEC_CHECK[1], 0xFF);
        assert!(DOWNSTREAM_CODEC_CHECK.iter().any(|&b| b >= 0x80));
    }
}
