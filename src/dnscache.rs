//! Downstream answer cache
//!
//! Recursive resolvers retransmit aggressively when an answer is withheld in
//! lazy mode. Replying with silence makes them try harder; replying with the
//! byte-identical previous answer calms them down. This small per-user ring
//! remembers the last few (query, answer payload) pairs so a retransmitted
//! query can be answered verbatim through the same wire codec.
//!
//! The client monotonic counter embedded in every data/ping label keeps
//! distinct logical queries from colliding here, as long as the ring stays
//! shorter than half the counter space.

use crate::dns::Query;

/// Ring capacity, well under half the data-CMC space.
pub const DNSCACHE_LEN: usize = 4;

struct Entry {
    id: u16,
    qtype: crate::dns::QueryType,
    name: Vec<u8>,
    answer: Vec<u8>,
}

/// Small per-user ring of answered queries.
pub struct AnswerCache {
    entries: Vec<Option<Entry>>,
    lastfilled: usize,
}

impl AnswerCache {
    pub fn new() -> Self {
        AnswerCache {
            entries: (0..DNSCACHE_LEN).map(|_| None).collect(),
            lastfilled: 0,
        }
    }

    /// Record the answer payload emitted for `q`. Queries with the vacant
    /// id sentinel and empty answers are never stored, so every live entry
    /// has a non-empty answer.
    pub fn store(&mut self, q: &Query, answer: &[u8]) {
        if q.id == 0 || answer.is_empty() {
            return;
        }
        let fill = (self.lastfilled + 1) % DNSCACHE_LEN;
        self.entries[fill] = Some(Entry {
            id: q.id,
            qtype: q.qtype,
            name: q.name.clone(),
            answer: answer.to_vec(),
        });
        self.lastfilled = fill;
    }

    /// Look up a retransmitted query, newest entry first. Matches on record
    /// type and case-sensitive owner name.
    pub fn lookup(&self, q: &Query) -> Option<&[u8]> {
        for i in 0..DNSCACHE_LEN {
            let probe = (self.lastfilled + DNSCACHE_LEN - i) % DNSCACHE_LEN;
            let Some(entry) = self.entries[probe].as_ref() else {
                continue;
            };
            if entry.id == 0 || entry.answer.is_empty() {
                continue;
            }
            if entry.qtype == q.qtype && entry.name == q.name {
                return Some(&entry.answer);
            }
        }
        None
    }
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new()
    }
}
