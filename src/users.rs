//! Session slots and the user table
//!
//! Sessions live in a fixed table of 16 slots; the slot id doubles as the
//! 4-bit user field of the raw-mode header and the leading nibble of
//! upstream data labels. A slot is created at version negotiation, bound to
//! the peer's source address, and only trusted once the login digest has
//! been verified. Idle slots may be reclaimed by new version handshakes.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::codec::{Codec, Downenc};
use crate::dnscache::AnswerCache;
use crate::frame::DOWNSTREAM_PING_HDR;
use crate::qmem::QueryMemory;
use crate::window::WindowBuffer;

/// Slot count; the wire format caps this at 16 (4-bit slot ids).
pub const MAX_USERS: usize = 16;

/// A slot with no frame received for this long counts as reclaimable.
pub const USER_IDLE: Duration = Duration::from_secs(60);

/// Conservative downstream fragsize assumed until the client probes.
pub const DEFAULT_FRAGSIZE: u16 = 100;

/// Ring capacity of each per-user window buffer.
const WINDOW_RING: usize = 64;

/// Outstanding unacked downstream fragments allowed per user.
const DOWNSTREAM_WINDOW: usize = 8;

/// Upstream fragments can be as large as the client's codec and resolver
/// path allow; this only bounds buffer allocation.
pub const MAX_FRAGSIZE: usize = 4096;

/// How a session's frames travel once established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    /// Fragments ride inside DNS queries and answers.
    DnsNull,
    /// Session upgraded to the raw UDP fast path.
    RawUdp,
}

/// Per-session state.
pub struct TunUser {
    pub slot: u8,
    /// Peer source address bound at version negotiation. Later queries
    /// naming this slot must arrive from it unless the check is disabled.
    pub host: SocketAddr,
    /// Random login challenge handed out with the version ACK.
    pub seed: u32,
    pub tun_ip: Ipv4Addr,
    pub authenticated: bool,
    pub authenticated_raw: bool,
    pub conn: ConnType,
    /// Upstream payload codec, switchable by the client.
    pub codec: Codec,
    pub downenc: Downenc,
    pub down_compression: bool,
    /// Downstream fragsize in encoded bytes, as negotiated.
    pub fragsize: u16,
    pub lazy: bool,
    /// How long a parked query may wait before it must be answered.
    pub dns_timeout: Duration,
    /// Sequence id of a received upstream fragment still owing an ACK.
    pub next_upstream_ack: Option<u8>,
    /// One-shot: the next scheduled answer must carry a ping frame.
    pub send_ping_next: bool,
    pub last_pkt: Instant,
    pub incoming: WindowBuffer,
    pub outgoing: WindowBuffer,
    pub qmem: QueryMemory,
    pub cache: AnswerCache,
}

impl TunUser {
    pub fn new(
        slot: u8,
        seed: u32,
        tun_ip: Ipv4Addr,
        host: SocketAddr,
        downenc: Downenc,
        dns_timeout: Duration,
        dedup_ignore_case: bool,
    ) -> Self {
        // until the client probes, assume base32-grade capacity
        let max_fragment = Codec::Base32
            .raw_length(DEFAULT_FRAGSIZE as usize)
            .saturating_sub(DOWNSTREAM_PING_HDR)
            .max(1);
        TunUser {
            slot,
            host,
            seed,
            tun_ip,
            authenticated: false,
            authenticated_raw: false,
            conn: ConnType::DnsNull,
            codec: Codec::Base32,
            downenc,
            down_compression: true,
            fragsize: DEFAULT_FRAGSIZE,
            lazy: false,
            dns_timeout,
            next_upstream_ack: None,
            send_ping_next: false,
            last_pkt: Instant::now(),
            incoming: WindowBuffer::new(WINDOW_RING, WINDOW_RING, MAX_FRAGSIZE),
            outgoing: WindowBuffer::new(WINDOW_RING, DOWNSTREAM_WINDOW, max_fragment),
            qmem: QueryMemory::new(dedup_ignore_case),
            cache: AnswerCache::new(),
        }
    }

    /// Downstream fragment payload that fits the negotiated fragsize after
    /// codec expansion and the ping header.
    pub fn max_downstream_fragment(&self) -> usize {
        (self.downenc.bits() as usize * self.fragsize as usize / 8)
            .saturating_sub(DOWNSTREAM_PING_HDR)
            .max(1)
    }

    /// Commit a new downstream fragsize and resize the outgoing window's
    /// fragment bound accordingly.
    pub fn apply_fragsize(&mut self, fragsize: u16) {
        self.fragsize = fragsize;
        let max = self.max_downstream_fragment();
        self.outgoing.set_max_fragment(max);
        log::info!(
            "user {}: max downstream fragment {} bytes ({} bits, {:?})",
            self.slot,
            max,
            self.downenc.bits(),
            self.downenc
        );
    }

    pub fn touch(&mut self) {
        self.last_pkt = Instant::now();
    }

    pub fn is_idle(&self) -> bool {
        self.last_pkt.elapsed() > USER_IDLE
    }
}

/// Fixed-size slotted table of sessions.
pub struct UserTable {
    slots: Vec<Option<TunUser>>,
    check_ip: bool,
    server_ip: Ipv4Addr,
    netmask: u8,
}

impl UserTable {
    pub fn new(server_ip: Ipv4Addr, netmask: u8, check_ip: bool) -> Self {
        let hosts = 2u32.saturating_pow(32 - netmask as u32);
        assert!(
            hosts as usize > MAX_USERS + 1,
            "netmask /{netmask} leaves no room for {MAX_USERS} clients"
        );
        UserTable {
            slots: (0..MAX_USERS).map(|_| None).collect(),
            check_ip,
            server_ip,
            netmask,
        }
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    pub fn netmask(&self) -> u8 {
        self.netmask
    }

    /// Tunnel address carved for a slot: server address + slot + 1.
    pub fn tunnel_ip(&self, slot: u8) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.server_ip) + slot as u32 + 1)
    }

    /// First slot that is unallocated or has gone idle.
    pub fn find_available(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| match slot {
                None => true,
                Some(user) => user.is_idle(),
            })
            .map(|i| i as u8)
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.as_ref().is_some_and(|u| !u.is_idle()))
            .count()
    }

    pub fn insert(&mut self, user: TunUser) {
        let slot = user.slot as usize;
        self.slots[slot] = Some(user);
    }

    pub fn get(&self, slot: u8) -> Option<&TunUser> {
        self.slots.get(slot as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: u8) -> Option<&mut TunUser> {
        self.slots.get_mut(slot as usize)?.as_mut()
    }

    /// Route lookup: live, authenticated session owning this tunnel IP.
    pub fn find_by_tun_ip(&self, ip: Ipv4Addr) -> Option<u8> {
        self.slots.iter().flatten().find_map(|user| {
            let live = (user.authenticated || user.authenticated_raw) && !user.is_idle();
            (live && user.tun_ip == ip).then_some(user.slot)
        })
    }

    /// The slot exists and the query came from its bound source address
    /// (full address compare, port included), unless checking is disabled.
    pub fn check_user_and_ip(&self, slot: u8, from: &SocketAddr) -> bool {
        match self.get(slot) {
            Some(user) => !self.check_ip || user.host == *from,
            None => false,
        }
    }

    /// The authoritative gate for data-plane commands: the slot must be
    /// password-authenticated AND the source address must match.
    pub fn check_authenticated_user_and_ip(&self, slot: u8, from: &SocketAddr) -> bool {
        self.check_user_and_ip(slot, from)
            && self.get(slot).is_some_and(|u| u.authenticated)
    }

    /// Most recent frame time across all users, for the idle shutdown.
    pub fn last_action(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|u| u.last_pkt).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.10:{port}").parse().unwrap()
    }

    fn table() -> UserTable {
        UserTable::new(Ipv4Addr::new(10, 53, 0, 1), 27, true)
    }

    fn user(table: &UserTable, slot: u8, port: u16) -> TunUser {
        TunUser::new(
            slot,
            0x1234_5678,
            table.tunnel_ip(slot),
            addr(port),
            Downenc::Base32,
            Duration::from_secs(2),
            false,
        )
    }

    #[test]
    fn tunnel_ips_are_consecutive() {
        let t = table();
        assert_eq!(t.tunnel_ip(0), Ipv4Addr::new(10, 53, 0, 2));
        assert_eq!(t.tunnel_ip(15), Ipv4Addr::new(10, 53, 0, 17));
    }

    #[test]
    #[should_panic]
    fn netmask_too_small_for_table() {
        UserTable::new(Ipv4Addr::new(10, 53, 0, 1), 28, true);
    }

    #[test]
    fn available_slots_fill_in_order() {
        let mut t = table();
        assert_eq!(t.find_available(), Some(0));
        t.insert(user(&t, 0, 4000));
        assert_eq!(t.find_available(), Some(1));
    }

    #[test]
    fn authenticated_check_requires_both_auth_and_source_match() {
        let mut t = table();
        t.insert(user(&t, 2, 4100));

        // unauthenticated: user/ip check passes, authenticated check fails
        assert!(t.check_user_and_ip(2, &addr(4100)));
        assert!(!t.check_authenticated_user_and_ip(2, &addr(4100)));

        t.get_mut(2).unwrap().authenticated = true;
        assert!(t.check_authenticated_user_and_ip(2, &addr(4100)));

        // source mismatch fails even when authenticated
        assert!(!t.check_authenticated_user_and_ip(2, &addr(4101)));
        // unknown slot always fails
        assert!(!t.check_authenticated_user_and_ip(9, &addr(4100)));
        assert!(!t.check_user_and_ip(16, &addr(4100)));
    }

    #[test]
    fn disabled_check_ignores_source_address() {
        let mut t = UserTable::new(Ipv4Addr::new(10, 53, 0, 1), 27, false);
        let mut u = user(&table(), 1, 4200);
        u.authenticated = true;
        t.insert(u);
        assert!(t.check_authenticated_user_and_ip(1, &addr(9999)));
    }

    #[test]
    fn route_lookup_requires_authentication() {
        let mut t = table();
        t.insert(user(&t, 3, 4300));
        let ip = t.tunnel_ip(3);
        assert_eq!(t.find_by_tun_ip(ip), None);
        t.get_mut(3).unwrap().authenticated = true;
        assert_eq!(t.find_by_tun_ip(ip), Some(3));
        // raw-mode auth is sufficient on its own
        let u = t.get_mut(3).unwrap();
        u.authenticated = false;
        u.authenticated_raw = true;
        assert_eq!(t.find_by_tun_ip(ip), Some(3));
    }

    #[test]
    fn fragsize_commit_recomputes_outgoing_bound() {
        let t = table();
        let mut u = user(&t, 0, 4400);
        u.downenc = Downenc::Raw;
        u.apply_fragsize(1000);
        assert_eq!(u.outgoing.max_fragment(), 1000 - DOWNSTREAM_PING_HDR);

        u.downenc = Downenc::Base32;
        u.apply_fragsize(1000);
        assert_eq!(u.outgoing.max_fragment(), 1000 * 5 / 8 - DOWNSTREAM_PING_HDR);
    }
}
