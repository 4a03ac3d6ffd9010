//! Virtual interface seam
//!
//! The server core never performs tun/tap syscalls. It speaks to the
//! virtual interface through a pair of bounded channels carrying whole IP
//! datagrams; whatever owns the other end (a real interface bridge, the
//! UDP loopback backend in `burrowd`, or a test harness) is free to move
//! the bytes however it likes.

use std::net::Ipv4Addr;

use tokio::sync::mpsc;

/// Channel depth; a full channel applies backpressure to the reader side.
const TUN_QUEUE: usize = 64;

/// Server-side handle: `rx` yields datagrams read from the interface,
/// `tx` accepts datagrams to be written to it.
pub struct TunHandle {
    pub rx: mpsc::Receiver<Vec<u8>>,
    pub tx: mpsc::Sender<Vec<u8>>,
}

/// Backend-side handle, mirror image of [`TunHandle`].
pub struct TunBackend {
    pub rx: mpsc::Receiver<Vec<u8>>,
    pub tx: mpsc::Sender<Vec<u8>>,
}

/// Create a connected handle/backend pair.
pub fn channel() -> (TunHandle, TunBackend) {
    let (to_server, from_backend) = mpsc::channel(TUN_QUEUE);
    let (to_backend, from_server) = mpsc::channel(TUN_QUEUE);
    (
        TunHandle {
            rx: from_backend,
            tx: to_backend,
        },
        TunBackend {
            rx: from_server,
            tx: to_server,
        },
    )
}

/// Destination address of an IPv4 datagram, used to pick the target user.
/// Returns `None` for truncated packets or non-IPv4 traffic.
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ))
}

/// Build a minimal IPv4 header + payload, for tests and the loopback backend.
pub fn build_ipv4(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45; // version 4, IHL 5
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64; // TTL
    pkt[9] = 0xFD; // "experimental" protocol; payload is opaque here
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());
    pkt[20..].copy_from_slice(payload);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_extraction() {
        let pkt = build_ipv4(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            b"data",
        );
        assert_eq!(ipv4_destination(&pkt), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn rejects_short_and_non_ipv4() {
        assert_eq!(ipv4_destination(&[0x45, 0x00]), None);
        let mut pkt = build_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, b"");
        pkt[0] = 0x60; // IPv6 version nibble
        assert_eq!(ipv4_destination(&pkt), None);
    }

    #[tokio::test]
    async fn channel_pair_is_connected() {
        let (mut handle, mut backend) = channel();
        backend.tx.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(handle.rx.recv().await.unwrap(), vec![1, 2, 3]);
        handle.tx.send(vec![4]).await.unwrap();
        assert_eq!(backend.rx.recv().await.unwrap(), vec![4]);
    }
}
