//! Cheap always-on counters.  Per-datagram failures are absorbed
//! rather than surfaced, so these are the only way to see them.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub datagrams_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub malformed: AtomicU64,
    pub queries_answered: AtomicU64,
    pub known_answers_suppressed: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            queries_answered: self.queries_answered.load(Ordering::Relaxed),
            known_answers_suppressed: self.known_answers_suppressed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CountersSnapshot {
    pub datagrams_received: u64,
    pub datagrams_sent: u64,
    pub malformed: u64,
    pub queries_answered: u64,
    pub known_answers_suppressed: u64,
}
