//! Query memory: the ring of parked queries
//!
//! Lazy mode only works if the server can hold a resolver's query open and
//! answer it later with something useful. Each user owns one of these rings;
//! it keeps recently answered queries around for duplicate detection and
//! tracks the pending region (accepted but unanswered) in strict FIFO order,
//! so an answered query is never revisited and an older query is never
//! overtaken by a newer one.

use crate::dns::Query;

/// Ring capacity; also the maximum number of simultaneously pending queries.
pub const QMEM_LEN: usize = 16;

/// Outcome of parking an incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Already in the ring; the caller answers with the one-byte illegal
    /// reply and stops processing the query.
    Duplicate,
    /// Every slot holds an unanswered query; the caller drops the query
    /// without responding and lets the resolver retransmit.
    Full,
    /// Parked; processing continues.
    Parked,
}

/// Fixed ring of query snapshots with pending-region accounting.
pub struct QueryMemory {
    queries: Vec<Option<Query>>,
    start: usize,
    end: usize,
    length: usize,
    start_pending: usize,
    num_pending: usize,
    dedup_ignore_case: bool,
}

impl QueryMemory {
    pub fn new(dedup_ignore_case: bool) -> Self {
        QueryMemory {
            queries: (0..QMEM_LEN).map(|_| None).collect(),
            start: 0,
            end: 0,
            length: 0,
            start_pending: 0,
            num_pending: 0,
            dedup_ignore_case,
        }
    }

    pub fn num_pending(&self) -> usize {
        self.num_pending
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn is_duplicate(&self, q: &Query) -> bool {
        (0..self.length)
            .map(|i| (self.start + i) % QMEM_LEN)
            .filter_map(|p| self.queries[p].as_ref())
            .any(|parked| {
                parked.id == q.id
                    && parked.qtype == q.qtype
                    && if self.dedup_ignore_case {
                        parked.name.eq_ignore_ascii_case(&q.name)
                    } else {
                        parked.name == q.name
                    }
            })
    }

    /// Park an incoming query, detecting retransmitted duplicates first.
    /// A new query only ever overwrites the oldest already-answered slot.
    pub fn append(&mut self, q: &Query) -> Append {
        if self.is_duplicate(q) {
            log::debug!("qmem: duplicate query id {} '{}'", q.id, q.name_utf8());
            return Append::Duplicate;
        }
        if self.num_pending >= QMEM_LEN {
            log::debug!("qmem: full of pending queries, dropping id {}", q.id);
            return Append::Full;
        }
        if self.length < QMEM_LEN {
            self.length += 1;
        } else {
            // reclaim the oldest slot; the pending guard above ensures it
            // has been answered
            self.start = (self.start + 1) % QMEM_LEN;
        }
        self.queries[self.end] = Some(q.clone());
        self.end = (self.end + 1) % QMEM_LEN;
        self.num_pending += 1;
        Append::Parked
    }

    /// The oldest unanswered query, left in place; the scheduler consumes
    /// it with [`answered`](Self::answered) after actually emitting.
    pub fn next_response(&self) -> Option<Query> {
        if self.length == 0 || self.num_pending == 0 {
            return None;
        }
        self.queries[self.start_pending].clone()
    }

    /// Mark the oldest pending query as answered. Calling this with nothing
    /// pending indicates a bug elsewhere; it is logged and ignored.
    pub fn answered(&mut self) {
        if self.num_pending == 0 {
            log::warn!("qmem: answered() with no pending query");
            return;
        }
        self.start_pending = (self.start_pending + 1) % QMEM_LEN;
        self.num_pending -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Query, QueryType};
    use std::net::SocketAddr;
    use std::time::Instant;

    fn query(id: u16, name: &str) -> Query {
        Query {
            id,
            qtype: QueryType::Null,
            name: name.as_bytes().to_vec(),
            from: "127.0.0.1:9999".parse::<SocketAddr>().unwrap(),
            destination: None,
            time_recv: Instant::now(),
        }
    }

    #[test]
    fn append_then_answer_in_fifo_order() {
        let mut qmem = QueryMemory::new(false);
        for id in 1..=3 {
            assert_eq!(qmem.append(&query(id, "a.t.test")), Append::Parked);
        }
        assert_eq!(qmem.num_pending(), 3);
        for id in 1..=3 {
            assert_eq!(qmem.next_response().unwrap().id, id);
            qmem.answered();
        }
        assert_eq!(qmem.num_pending(), 0);
        assert!(qmem.next_response().is_none());
    }

    #[test]
    fn duplicate_is_detected_while_parked_and_after_answer() {
        let mut qmem = QueryMemory::new(false);
        let q = query(7, "dup.t.test");
        assert_eq!(qmem.append(&q), Append::Parked);
        assert_eq!(qmem.append(&q), Append::Duplicate);
        qmem.answered();
        // still in the ring after being answered
        assert_eq!(qmem.append(&q), Append::Duplicate);
    }

    #[test]
    fn dedup_case_sensitivity_is_gated() {
        let exact = query(9, "AbC.t.test");
        let recased = query(9, "abc.t.test");

        let mut strict = QueryMemory::new(false);
        strict.append(&exact);
        assert_eq!(strict.append(&recased), Append::Parked);

        let mut relaxed = QueryMemory::new(true);
        relaxed.append(&exact);
        assert_eq!(relaxed.append(&recased), Append::Duplicate);
    }

    #[test]
    fn full_of_pending_rejects_without_parking() {
        let mut qmem = QueryMemory::new(false);
        for id in 0..QMEM_LEN as u16 {
            assert_eq!(qmem.append(&query(id + 1, "q.t.test")), Append::Parked);
        }
        assert_eq!(qmem.append(&query(100, "overflow.t.test")), Append::Full);
        assert_eq!(qmem.num_pending(), QMEM_LEN);

        // answering one slot makes room again (end-to-end scenario:
        // backpressure is released by the scheduler answering)
        qmem.answered();
        assert_eq!(qmem.append(&query(100, "overflow.t.test")), Append::Parked);
    }

    #[test]
    fn overwrite_only_hits_answered_slots() {
        let mut qmem = QueryMemory::new(false);
        for id in 0..QMEM_LEN as u16 {
            qmem.append(&query(id + 1, "w.t.test"));
        }
        // answer half, then refill past capacity: the ring reclaims only
        // answered slots and the pending region survives intact
        for _ in 0..8 {
            qmem.answered();
        }
        for id in 0..8u16 {
            assert_eq!(qmem.append(&query(200 + id, "w2.t.test")), Append::Parked);
        }
        assert_eq!(qmem.num_pending(), QMEM_LEN);
        assert_eq!(qmem.next_response().unwrap().id, 9);
    }

    #[test]
    fn answered_underflow_is_tolerated() {
        let mut qmem = QueryMemory::new(false);
        qmem.answered(); // logged, no panic, no state change
        assert_eq!(qmem.num_pending(), 0);
        qmem.append(&query(1, "x.t.test"));
        assert_eq!(qmem.next_response().unwrap().id, 1);
    }

    #[test]
    fn pending_invariants_hold_under_churn() {
        let mut qmem = QueryMemory::new(false);
        let mut next_id = 1u16;
        for round in 0..50 {
            for _ in 0..(round % 5) + 1 {
                qmem.append(&query(next_id, "churn.t.test"));
                next_id += 1;
            }
            for _ in 0..(round % 3) + 1 {
                if qmem.num_pending() > 0 {
                    qmem.answered();
                }
            }
            assert!(qmem.num_pending() <= qmem.len());
            assert!(qmem.len() <= QMEM_LEN);
        }
    }
}
