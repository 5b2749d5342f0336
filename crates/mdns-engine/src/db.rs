//! The authoritative record database.
//!
//! Keyed by `(owner name, rtype)`, case-insensitively (names compare
//! lowercased).  A key may hold several records: the shared PTR for
//! a service type collects one entry per instance, and a host's A
//! name holds one record per advertised interface.  Unique records
//! (cache-flush set) admit a single owning service per key.
//!
//! The per-`(key, interface)` multicast rate-limit table lives under
//! the same lock as the records, since every sender consults both
//! together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use mdns_types::protocol::types::{
    DomainName, QueryType, RecordType, ResourceRecord,
};

use crate::service::{ProjectedRecord, ServiceId};

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] record db lock poisoned, cannot recover from this - aborting";

/// Minimum spacing between multicasts of the same record on the same
/// interface (RFC 6762 section 6).
pub const MULTICAST_MIN_INTERVAL: Duration = Duration::from_secs(1);

pub type RecordKey = (DomainName, RecordType);

/// Why an insert was refused.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InsertError {
    /// Another local service already claims this unique name.
    LocalConflict { holder: ServiceId },
}

/// Lifecycle state of a service, as far as answering is concerned.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceState {
    /// Probing: records are tentative and must never be served.
    Probing,

    /// Announced: records are authoritative and answerable.
    Announced,
}

/// A record plus its ownership and interface metadata.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: ResourceRecord,
    pub owner: ServiceId,
    /// `Some` for records specific to one interface (the per-
    /// interface A records).
    pub ifindex: Option<u32>,
}

/// A convenience wrapper around the database which lets it be shared
/// between tasks: the responder writes, the query engine reads.
///
/// Invoking `clone` gives a new instance which refers to the same
/// underlying state.
#[derive(Debug, Clone, Default)]
pub struct SharedRecordDb {
    inner: Arc<RwLock<RecordDb>>,
}

impl SharedRecordDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a service in the probing state.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn add_service(&self, id: ServiceId) {
        self.inner
            .write()
            .expect(LOCK_POISON_MESSAGE)
            .add_service(id);
    }

    /// Insert a service's projected records, all-or-nothing.  Fails
    /// if a unique record's key is already claimed by a different
    /// local service, whether or not that service has finished
    /// probing.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn insert_records(
        &self,
        id: ServiceId,
        records: &[ProjectedRecord],
    ) -> Result<(), InsertError> {
        self.inner
            .write()
            .expect(LOCK_POISON_MESSAGE)
            .insert_records(id, records)
    }

    /// Mark a service announced: its records become answerable.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn set_announced(&self, id: ServiceId) {
        self.inner
            .write()
            .expect(LOCK_POISON_MESSAGE)
            .set_state(id, ServiceState::Announced);
    }

    /// Remove a service and all its records, returning the removed
    /// records (the material for a goodbye).
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn remove_service(&self, id: ServiceId) -> Vec<StoredRecord> {
        self.inner
            .write()
            .expect(LOCK_POISON_MESSAGE)
            .remove_service(id)
    }

    /// Answerable records matching a question, i.e. records of
    /// announced services.  `ANY` matches every type.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn lookup(&self, name: &DomainName, qtype: QueryType) -> Vec<StoredRecord> {
        self.inner
            .read()
            .expect(LOCK_POISON_MESSAGE)
            .lookup(name, qtype)
    }

    /// Whether a multicast of this record on this interface is
    /// permitted now.  `exempt` covers the protocol's exceptions:
    /// unsolicited announcements, TTL changes, and known-answer
    /// continuations (TC queries).
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn may_multicast(
        &self,
        key: &RecordKey,
        ifindex: u32,
        now: Instant,
        exempt: bool,
    ) -> bool {
        self.inner
            .read()
            .expect(LOCK_POISON_MESSAGE)
            .may_multicast(key, ifindex, now, exempt)
    }

    /// Record that a multicast of this record went out on this
    /// interface.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn note_multicast(&self, key: &RecordKey, ifindex: u32, now: Instant) {
        self.inner
            .write()
            .expect(LOCK_POISON_MESSAGE)
            .note_multicast(key, ifindex, now);
    }

    /// How long ago this record was last multicast on this
    /// interface; `None` if it never was.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn last_multicast_age(
        &self,
        key: &RecordKey,
        ifindex: u32,
        now: Instant,
    ) -> Option<Duration> {
        self.inner
            .read()
            .expect(LOCK_POISON_MESSAGE)
            .last_multicast_age(key, ifindex, now)
    }
}

/// The database proper.  You probably want `SharedRecordDb` instead.
#[derive(Debug, Default)]
struct RecordDb {
    records: HashMap<RecordKey, Vec<StoredRecord>>,
    services: HashMap<ServiceId, ServiceEntry>,
    last_multicast: HashMap<(DomainName, RecordType, u32), Instant>,
}

#[derive(Debug)]
struct ServiceEntry {
    state: ServiceState,
    keys: Vec<RecordKey>,
}

impl RecordDb {
    fn add_service(&mut self, id: ServiceId) {
        self.services.insert(
            id,
            ServiceEntry {
                state: ServiceState::Probing,
                keys: Vec::new(),
            },
        );
    }

    fn insert_records(
        &mut self,
        id: ServiceId,
        records: &[ProjectedRecord],
    ) -> Result<(), InsertError> {
        // reject before mutating anything: a partial insert would
        // leave a half-claimed name behind
        for pr in records {
            if !pr.record.cache_flush {
                continue;
            }
            let key = record_key(&pr.record);
            if let Some(existing) = self.records.get(&key) {
                if let Some(holder) = existing
                    .iter()
                    .map(|stored| stored.owner)
                    .find(|owner| *owner != id)
                {
                    return Err(InsertError::LocalConflict { holder });
                }
            }
        }

        let entry = self.services.entry(id).or_insert(ServiceEntry {
            state: ServiceState::Probing,
            keys: Vec::new(),
        });

        for pr in records {
            let key = record_key(&pr.record);
            let stored = StoredRecord {
                record: pr.record.clone(),
                owner: id,
                ifindex: pr.ifindex,
            };

            let slot = self.records.entry(key.clone()).or_default();
            if pr.record.cache_flush {
                // at most one authoritative record per unique (name,
                // rtype, interface): replace rather than accumulate
                slot.retain(|existing| {
                    existing.owner != id || existing.ifindex != pr.ifindex
                });
            } else {
                slot.retain(|existing| {
                    existing.owner != id || !existing.record.same_data(&pr.record)
                });
            }
            slot.push(stored);

            if !entry.keys.contains(&key) {
                entry.keys.push(key);
            }
        }

        Ok(())
    }

    fn set_state(&mut self, id: ServiceId, state: ServiceState) {
        if let Some(entry) = self.services.get_mut(&id) {
            entry.state = state;
        }
    }

    fn remove_service(&mut self, id: ServiceId) -> Vec<StoredRecord> {
        let Some(entry) = self.services.remove(&id) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for key in entry.keys {
            if let Some(slot) = self.records.get_mut(&key) {
                let mut kept = Vec::with_capacity(slot.len());
                for stored in slot.drain(..) {
                    if stored.owner == id {
                        removed.push(stored);
                    } else {
                        kept.push(stored);
                    }
                }
                *slot = kept;
            }
            if self.records.get(&key).is_some_and(Vec::is_empty) {
                self.records.remove(&key);
            }
            self.last_multicast
                .retain(|(name, rtype, _), _| !(name == &key.0 && *rtype == key.1));
        }
        removed
    }

    fn lookup(&self, name: &DomainName, qtype: QueryType) -> Vec<StoredRecord> {
        let mut out = Vec::new();
        for ((owner, _), slot) in &self.records {
            if owner != name {
                continue;
            }
            for stored in slot {
                if !stored.record.rtype_with_data.matches(qtype) {
                    continue;
                }
                let answerable = self
                    .services
                    .get(&stored.owner)
                    .is_some_and(|entry| entry.state == ServiceState::Announced);
                if answerable {
                    out.push(stored.clone());
                }
            }
        }
        out
    }

    fn may_multicast(&self, key: &RecordKey, ifindex: u32, now: Instant, exempt: bool) -> bool {
        if exempt {
            return true;
        }
        match self
            .last_multicast
            .get(&(key.0.clone(), key.1, ifindex))
        {
            Some(at) => now.duration_since(*at) >= MULTICAST_MIN_INTERVAL,
            None => true,
        }
    }

    fn note_multicast(&mut self, key: &RecordKey, ifindex: u32, now: Instant) {
        self.last_multicast
            .insert((key.0.clone(), key.1, ifindex), now);
    }

    fn last_multicast_age(
        &self,
        key: &RecordKey,
        ifindex: u32,
        now: Instant,
    ) -> Option<Duration> {
        self.last_multicast
            .get(&(key.0.clone(), key.1, ifindex))
            .map(|at| now.duration_since(*at))
    }
}

/// The database key of a record: its owner name (compared
/// case-insensitively) and type.
pub fn record_key(record: &ResourceRecord) -> RecordKey {
    (record.name.clone(), record.rtype_with_data.rtype())
}
