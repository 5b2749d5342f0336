//! Answering incoming queries from the record database.
//!
//! For each question this matches answerable records, drops the ones
//! the querier already knows (known-answer suppression), picks
//! unicast or multicast delivery from the QU bit, restricts A
//! records to the interface the query arrived on, fills the
//! additional section with the rest of the service's record set, and
//! applies the per-record multicast rate limit.

use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mdns_types::protocol::types::*;

use crate::counters::EngineCounters;
use crate::db::{record_key, SharedRecordDb, StoredRecord};

/// Where a response should go.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Destination {
    Multicast,
    Unicast(SocketAddr),
}

/// A response ready for the transport, with the delay the protocol
/// asks us to wait before sending it.
#[derive(Debug)]
pub struct OutboundResponse {
    pub message: Message,
    pub destination: Destination,
    /// Interface to emit on: the one the query arrived on (zero for
    /// unknown, which sends on the system default).
    pub ifindex: u32,
    pub delay: Duration,
}

pub struct QueryEngine {
    db: SharedRecordDb,
    counters: Arc<EngineCounters>,
    delay_range_ms: (u64, u64),
}

impl QueryEngine {
    pub fn new(
        db: SharedRecordDb,
        counters: Arc<EngineCounters>,
        delay_range_ms: (u64, u64),
    ) -> Self {
        Self {
            db,
            counters,
            delay_range_ms,
        }
    }

    /// Build the responses (if any) to one incoming query.
    pub fn handle_query(
        &self,
        query: &Message,
        source: SocketAddr,
        ifindex: u32,
    ) -> Vec<OutboundResponse> {
        // non-standard opcodes and non-zero rcodes are silently
        // ignored (RFC 6762 sections 18.3, 18.11)
        if query.header.is_response
            || query.header.opcode != Opcode::Standard
            || query.header.rcode != Rcode::NoError
        {
            return Vec::new();
        }

        let now = Instant::now();

        // a query from a port other than 5353 is a legacy one-shot
        // querier: it cannot hear multicast responses (RFC 6762
        // section 6.7)
        let legacy = source.port() != MDNS_PORT;

        let mut multicast_answers: Vec<ResourceRecord> = Vec::new();
        let mut unicast_answers: Vec<ResourceRecord> = Vec::new();

        for question in &query.questions {
            let mut matched = self.db.lookup(&question.name, question.qtype);
            matched.retain(|stored| stored.record.rclass.matches(question.qclass));
            let mut matched = restrict_to_interface(matched, ifindex);

            // known-answer suppression (RFC 6762 section 7.1): a
            // record the querier holds at half TTL or more is omitted
            matched.retain(|stored| {
                let suppressed = query.answers.iter().any(|known| {
                    known.same_data(&stored.record) && known.ttl >= stored.record.ttl / 2
                });
                if suppressed {
                    self.counters
                        .known_answers_suppressed
                        .fetch_add(1, Ordering::Relaxed);
                }
                !suppressed
            });

            for stored in matched {
                let record = stored.record;
                if question.unicast_response || legacy {
                    // QU: answer unicast, and additionally multicast
                    // if the record has not been multicast within a
                    // quarter of its TTL (RFC 6762 section 5.4)
                    if self.stale_on_wire(&record, ifindex, now) {
                        push_unless_present(&mut multicast_answers, record.clone());
                    }
                    push_unless_present(&mut unicast_answers, record);
                } else {
                    push_unless_present(&mut multicast_answers, record);
                }
            }
        }

        // the rate limit applies to multicast only (RFC 6762 section
        // 6); TC on the query means known answers are still coming,
        // which exempts the eventual reply
        let exempt = query.header.is_truncated;
        multicast_answers.retain(|record| {
            let key = record_key(record);
            if self.db.may_multicast(&key, ifindex, now, exempt) {
                self.db.note_multicast(&key, ifindex, now);
                true
            } else {
                false
            }
        });

        let mut responses = Vec::new();

        if !multicast_answers.is_empty() {
            let additional = self.additionals_for(&multicast_answers, ifindex);
            let delay = self.multicast_delay(&multicast_answers);
            let mut message = Message::response();
            message.answers = multicast_answers;
            message.additional = additional;
            responses.push(OutboundResponse {
                message,
                destination: Destination::Multicast,
                ifindex,
                delay,
            });
        }

        if !unicast_answers.is_empty() {
            let additional = self.additionals_for(&unicast_answers, ifindex);
            let mut message = Message::response();
            // a unicast response echoes the query ID so legacy
            // resolvers can match it (RFC 6762 section 18.1); legacy
            // responses also repeat the question
            message.header.id = query.header.id;
            if legacy {
                message.questions = query.questions.clone();
            }
            message.answers = unicast_answers;
            message.additional = additional;
            responses.push(OutboundResponse {
                message,
                destination: Destination::Unicast(source),
                ifindex,
                delay: Duration::ZERO,
            });
        }

        if !responses.is_empty() {
            self.counters.queries_answered.fetch_add(1, Ordering::Relaxed);
        }

        responses
    }

    /// Whether a record is due a multicast refresh: it has not been
    /// on the wire within a quarter of its TTL.
    fn stale_on_wire(&self, record: &ResourceRecord, ifindex: u32, now: Instant) -> bool {
        let quarter_ttl = Duration::from_secs(u64::from(record.ttl) / 4);
        match self
            .db
            .last_multicast_age(&record_key(record), ifindex, now)
        {
            Some(age) => age > quarter_ttl,
            None => true,
        }
    }

    /// The DNS-SD additional section (RFC 6763 section 12): PTR
    /// answers carry their SRV + TXT + A + NSEC, SRV answers their A
    /// + NSEC, and every unique owner name its NSEC.
    fn additionals_for(&self, answers: &[ResourceRecord], ifindex: u32) -> Vec<ResourceRecord> {
        let mut additional: Vec<ResourceRecord> = Vec::new();

        let push = |record: ResourceRecord, additional: &mut Vec<ResourceRecord>| {
            if !answers.iter().any(|a| a.same_data(&record)) {
                push_unless_present(additional, record);
            }
        };

        for answer in answers {
            match &answer.rtype_with_data {
                RecordTypeWithData::PTR { ptrname } => {
                    let mut srv_targets = Vec::new();
                    for stored in self.records_at(ptrname, ifindex) {
                        if let RecordTypeWithData::SRV { target, .. } =
                            &stored.record.rtype_with_data
                        {
                            srv_targets.push(target.clone());
                        }
                        push(stored.record, &mut additional);
                    }
                    for target in srv_targets {
                        for stored in self.records_at(&target, ifindex) {
                            push(stored.record, &mut additional);
                        }
                    }
                }
                RecordTypeWithData::SRV { target, .. } => {
                    for stored in self.records_at(target, ifindex) {
                        push(stored.record, &mut additional);
                    }
                }
                _ => {}
            }
        }

        // negative assertions for the unique names we answered for,
        // so peers do not go on to probe the missing types
        for answer in answers {
            if !answer.cache_flush {
                continue;
            }
            for stored in self.records_at(&answer.name, ifindex) {
                if stored.record.rtype_with_data.rtype() == RecordType::NSEC {
                    push(stored.record, &mut additional);
                }
            }
        }

        additional
    }

    fn records_at(&self, name: &DomainName, ifindex: u32) -> Vec<StoredRecord> {
        restrict_to_interface(self.db.lookup(name, QueryType::Wildcard), ifindex)
    }

    fn multicast_delay(&self, answers: &[ResourceRecord]) -> Duration {
        let mut rng = rand::thread_rng();
        // responses that are entirely unique records need almost no
        // aggregation delay (RFC 6762 section 6)
        if answers.iter().all(|record| record.cache_flush) {
            Duration::from_millis(rng.gen_range(0..=10))
        } else {
            let (lo, hi) = self.delay_range_ms;
            Duration::from_millis(rng.gen_range(lo..=hi.max(lo)))
        }
    }
}

/// Keep only the records valid on the arrival interface: interface-
/// tagged records (the per-interface A records) must match it, so a
/// response never names an address belonging to a different link
/// (RFC 6762 section 15).  An unknown arrival interface (zero) falls
/// back to the host-default, taken as the lowest advertised index.
fn restrict_to_interface(mut records: Vec<StoredRecord>, ifindex: u32) -> Vec<StoredRecord> {
    let wanted = if ifindex == 0 {
        records.iter().filter_map(|stored| stored.ifindex).min()
    } else {
        Some(ifindex)
    };

    records.retain(|stored| match stored.ifindex {
        None => true,
        Some(tagged) => Some(tagged) == wanted,
    });
    records
}

fn push_unless_present(records: &mut Vec<ResourceRecord>, record: ResourceRecord) {
    if !records.iter().any(|existing| existing.same_data(&record)) {
        records.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdns_types::protocol::types::test_util::*;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    use crate::db::SharedRecordDb;
    use crate::iface::Interface;
    use crate::service::{self, Service, ServiceId};

    const ETH0: u32 = 2;
    const DOCKER0: u32 = 5;

    fn engine() -> (QueryEngine, SharedRecordDb) {
        let db = SharedRecordDb::new();
        let counters = Arc::new(EngineCounters::default());
        (QueryEngine::new(db.clone(), counters, (20, 120)), db)
    }

    fn announce_printer(db: &SharedRecordDb) {
        let service = Service {
            instance: "Printer".to_string(),
            service_type: "_ipp._tcp".to_string(),
            port: 631,
            hostname: Some("mac".to_string()),
            txt: BTreeMap::from([("rp".to_string(), "printers/ipp/print".to_string())]),
        };
        let interfaces = [
            Interface {
                index: ETH0,
                name: "eth0".to_string(),
                addrs: vec![Ipv4Addr::new(10, 0, 0, 5)],
            },
            Interface {
                index: DOCKER0,
                name: "docker0".to_string(),
                addrs: vec![Ipv4Addr::new(172, 17, 0, 1)],
            },
        ];
        let projected = service::project(&service, "mac", &interfaces).unwrap();

        let id = ServiceId(1);
        db.add_service(id);
        db.insert_records(id, &projected.all()).unwrap();
        db.set_announced(id);
    }

    fn multicast_query(name: &str, qtype: QueryType) -> Message {
        Message::query(vec![Question::new(domain(name), qtype)])
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 99], MDNS_PORT))
    }

    fn answers_of(responses: &[OutboundResponse]) -> Vec<&ResourceRecord> {
        responses
            .iter()
            .flat_map(|response| response.message.answers.iter())
            .collect()
    }

    #[test]
    fn ptr_query_gets_full_service_record_set() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("_ipp._tcp.local.", QueryType::Record(RecordType::PTR));
        let responses = engine.handle_query(&query, peer(), ETH0);

        assert_eq!(1, responses.len());
        let response = &responses[0];
        assert_eq!(Destination::Multicast, response.destination);
        assert!(response.message.header.is_authoritative);
        assert_eq!(0, response.message.header.id);

        assert_eq!(1, response.message.answers.len());
        assert_eq!(
            RecordType::PTR,
            response.message.answers[0].rtype_with_data.rtype()
        );

        let additional_types: Vec<RecordType> = response
            .message
            .additional
            .iter()
            .map(|rr| rr.rtype_with_data.rtype())
            .collect();
        assert!(additional_types.contains(&RecordType::SRV));
        assert!(additional_types.contains(&RecordType::TXT));
        assert!(additional_types.contains(&RecordType::A));
        assert!(additional_types.contains(&RecordType::NSEC));
    }

    #[test]
    fn a_records_match_the_arrival_interface_only() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("mac.local.", QueryType::Record(RecordType::A));

        let on_eth0 = engine.handle_query(&query, peer(), ETH0);
        let addrs: Vec<_> = answers_of(&on_eth0)
            .iter()
            .filter_map(|rr| match &rr.rtype_with_data {
                RecordTypeWithData::A { address } => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 5)], addrs);

        let on_docker0 = engine.handle_query(&query, peer(), DOCKER0);
        let addrs: Vec<_> = answers_of(&on_docker0)
            .iter()
            .filter_map(|rr| match &rr.rtype_with_data {
                RecordTypeWithData::A { address } => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(vec![Ipv4Addr::new(172, 17, 0, 1)], addrs);
    }

    #[test]
    fn unknown_arrival_interface_falls_back_to_host_default() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        let responses = engine.handle_query(&query, peer(), 0);

        let addrs: Vec<_> = answers_of(&responses)
            .iter()
            .filter_map(|rr| match &rr.rtype_with_data {
                RecordTypeWithData::A { address } => Some(*address),
                _ => None,
            })
            .collect();
        // the lowest-index interface is the host default
        assert_eq!(vec![Ipv4Addr::new(10, 0, 0, 5)], addrs);
    }

    #[test]
    fn known_answer_at_half_ttl_is_suppressed() {
        let (engine, db) = engine();
        announce_printer(&db);

        let mut query =
            multicast_query("_ipp._tcp.local.", QueryType::Record(RecordType::PTR));
        let mut known = ptr_record("_ipp._tcp.local.", "Printer._ipp._tcp.local.");
        known.ttl = 3000; // >= 4500 / 2
        query.answers.push(known);

        assert!(engine.handle_query(&query, peer(), ETH0).is_empty());
    }

    #[test]
    fn known_answer_below_half_ttl_is_not_suppressed() {
        let (engine, db) = engine();
        announce_printer(&db);

        let mut query =
            multicast_query("_ipp._tcp.local.", QueryType::Record(RecordType::PTR));
        let mut known = ptr_record("_ipp._tcp.local.", "Printer._ipp._tcp.local.");
        known.ttl = 2000; // < 4500 / 2
        query.answers.push(known);

        let responses = engine.handle_query(&query, peer(), ETH0);
        assert_eq!(1, answers_of(&responses).len());
    }

    #[test]
    fn known_answer_suppression_keeps_other_instances() {
        let (engine, db) = engine();

        // two instances of the same type, from two services
        for (id, instance) in [(1, "Web"), (2, "API")] {
            let service = Service {
                instance: instance.to_string(),
                service_type: "_http._tcp".to_string(),
                port: 80,
                hostname: Some(instance.to_string()),
                txt: BTreeMap::new(),
            };
            let interfaces = [Interface {
                index: ETH0,
                name: "eth0".to_string(),
                addrs: vec![Ipv4Addr::new(10, 0, 0, 5)],
            }];
            let projected = service::project(&service, "x", &interfaces).unwrap();
            let id = ServiceId(id);
            db.add_service(id);
            db.insert_records(id, &projected.all()).unwrap();
            db.set_announced(id);
        }

        let mut query =
            multicast_query("_http._tcp.local.", QueryType::Record(RecordType::PTR));
        let mut known = ptr_record("_http._tcp.local.", "Web._http._tcp.local.");
        known.ttl = 3000;
        query.answers.push(known);

        let responses = engine.handle_query(&query, peer(), ETH0);
        let answers = answers_of(&responses);
        assert_eq!(1, answers.len());
        match &answers[0].rtype_with_data {
            RecordTypeWithData::PTR { ptrname } => {
                assert_eq!(domain("API._http._tcp.local."), *ptrname);
            }
            other => panic!("not a PTR: {other:?}"),
        }
    }

    #[test]
    fn qu_question_is_answered_unicast() {
        let (engine, db) = engine();
        announce_printer(&db);

        // simulate a recent multicast of every record so the
        // quarter-TTL rule does not add a multicast copy
        let now = Instant::now();
        for stored in db.lookup(&domain("mac.local."), QueryType::Wildcard) {
            db.note_multicast(&record_key(&stored.record), ETH0, now);
        }

        let mut query = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        query.questions[0].unicast_response = true;

        let responses = engine.handle_query(&query, peer(), ETH0);
        assert_eq!(1, responses.len());
        assert_eq!(Destination::Unicast(peer()), responses[0].destination);
    }

    #[test]
    fn qu_question_also_multicasts_when_stale() {
        let (engine, db) = engine();
        announce_printer(&db);

        // never multicast: the record is overdue on the wire
        let mut query = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        query.questions[0].unicast_response = true;

        let responses = engine.handle_query(&query, peer(), ETH0);
        let destinations: Vec<_> = responses.iter().map(|r| r.destination).collect();
        assert!(destinations.contains(&Destination::Unicast(peer())));
        assert!(destinations.contains(&Destination::Multicast));
    }

    #[test]
    fn legacy_source_port_gets_unicast_with_echoed_id() {
        let (engine, db) = engine();
        announce_printer(&db);

        let mut query = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        query.header.id = 0x1234;
        let legacy_peer = SocketAddr::from(([192, 168, 1, 99], 50000));

        let responses = engine.handle_query(&query, legacy_peer, ETH0);
        let unicast = responses
            .iter()
            .find(|r| r.destination == Destination::Unicast(legacy_peer))
            .unwrap();
        assert_eq!(0x1234, unicast.message.header.id);
        assert_eq!(query.questions, unicast.message.questions);
    }

    #[test]
    fn repeated_query_is_rate_limited() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("_ipp._tcp.local.", QueryType::Record(RecordType::PTR));

        let first = engine.handle_query(&query, peer(), ETH0);
        assert_eq!(1, first.len());

        // immediately repeated: the PTR was just multicast
        let second = engine.handle_query(&query, peer(), ETH0);
        assert!(second.is_empty());
    }

    #[test]
    fn tc_query_is_exempt_from_rate_limiting() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("_ipp._tcp.local.", QueryType::Record(RecordType::PTR));
        assert_eq!(1, engine.handle_query(&query, peer(), ETH0).len());

        let mut continuation = query.clone();
        continuation.header.is_truncated = true;
        assert_eq!(1, engine.handle_query(&continuation, peer(), ETH0).len());
    }

    #[test]
    fn responses_and_bad_opcodes_are_ignored() {
        let (engine, db) = engine();
        announce_printer(&db);

        let mut response = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        response.header.is_response = true;
        assert!(engine.handle_query(&response, peer(), ETH0).is_empty());

        let mut status = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        status.header.opcode = Opcode::Status;
        assert!(engine.handle_query(&status, peer(), ETH0).is_empty());
    }

    #[test]
    fn any_query_matches_every_type_at_the_name() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("Printer._ipp._tcp.local.", QueryType::Wildcard);
        let responses = engine.handle_query(&query, peer(), ETH0);
        let types: Vec<RecordType> = answers_of(&responses)
            .iter()
            .map(|rr| rr.rtype_with_data.rtype())
            .collect();

        assert!(types.contains(&RecordType::SRV));
        assert!(types.contains(&RecordType::TXT));
        assert!(types.contains(&RecordType::NSEC));
    }

    #[test]
    fn unique_only_response_uses_short_delay() {
        let (engine, db) = engine();
        announce_printer(&db);

        let query = multicast_query("mac.local.", QueryType::Record(RecordType::A));
        let responses = engine.handle_query(&query, peer(), ETH0);
        assert!(responses[0].delay <= Duration::from_millis(10));

        let (engine, db) = self::engine();
        announce_printer(&db);
        let query = multicast_query("_ipp._tcp.local.", QueryType::Record(RecordType::PTR));
        let responses = engine.handle_query(&query, peer(), ETH0);
        let delay = responses[0].delay;
        assert!(delay >= Duration::from_millis(20) && delay <= Duration::from_millis(120));
    }
}
