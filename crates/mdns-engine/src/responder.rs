//! The responder: service registration and the per-service
//! lifecycle state machine.
//!
//! Each registered service runs its own task through the RFC 6762
//! lifecycle: probe the unique names (section 8.1), resolve
//! conflicts by tie-break and rename (sections 8.2, 9), announce
//! (section 8.3), answer from the shared database while idle, and
//! say goodbye with zero TTLs on the way out (section 10.1).

use rand::Rng;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant as TokioInstant};

use mdns_types::protocol::types::*;

use crate::config::Config;
use crate::counters::CountersSnapshot;
use crate::db::{record_key, SharedRecordDb};
use crate::engine::{run_reader, EngineCore, Inbound};
use crate::error::Error;
use crate::iface::Interface;
use crate::querier::Querier;
use crate::query::{Destination, OutboundResponse, QueryEngine};
use crate::service::{self, ProjectedRecords, Service, ServiceId};

/// Spacing between probe queries (RFC 6762 section 8.1).
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound of the random delay before the first probe, to
/// desynchronise hosts that power on together (RFC 6762 section 8.1).
const PROBE_JITTER_MAX_MS: u64 = 50;

/// Spacing between announcements and between goodbyes.
const RECORD_SET_INTERVAL: Duration = Duration::from_secs(1);

/// How long a probe loser waits before renaming and trying again
/// (RFC 6762 section 8.2).
const CONFLICT_DEFER: Duration = Duration::from_secs(1);

/// How many names a service may try before registration fails with
/// `ConflictUnresolved`.
const MAX_NAME_ATTEMPTS: u32 = 10;

/// How long `shutdown` waits for goodbyes before closing the socket.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// How often an idle service re-checks its advertised interfaces.
const INTERFACE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Commands a service task accepts from the responder.
enum ServiceCommand {
    Deregister { done: oneshot::Sender<()> },
}

/// A successfully registered service.  The instance name is the one
/// actually claimed, which differs from the requested one when
/// probing forced a rename.
#[derive(Debug)]
pub struct ServiceHandle {
    id: ServiceId,
    pub instance: String,
}

/// The mDNS responder.
///
/// Dropping the responder does not say goodbye; call
/// [`Responder::shutdown`] for a clean exit.  All async operations
/// here are cancel-safe: dropping a `register` future abandons the
/// wait but the lifecycle continues until deregistration or
/// shutdown.
pub struct Responder {
    core: Arc<EngineCore>,
    db: SharedRecordDb,
    services: Mutex<HashMap<ServiceId, mpsc::Sender<ServiceCommand>>>,
    service_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    hostname: String,
}

impl Responder {
    /// Bind the shared socket, join the multicast group on the
    /// selected interfaces, and start the reader and query-answering
    /// tasks.  Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self, Error> {
        let db = SharedRecordDb::new();
        let core = EngineCore::bind(config)?;
        let engine = Arc::new(QueryEngine::new(
            db.clone(),
            core.counters.clone(),
            core.config.response_delay_range_ms,
        ));

        tokio::spawn(run_reader(core.clone()));
        tokio::spawn(run_answerer(core.clone(), engine));

        Ok(Self {
            core,
            db,
            services: Mutex::new(HashMap::new()),
            service_tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            hostname: machine_hostname(),
        })
    }

    /// Register a service.  Resolves once the service has finished
    /// announcing, with the name it finally claimed; fails with
    /// `ConfigError` for an invalid definition or
    /// `ConflictUnresolved` when every fallback name lost its probe.
    pub async fn register(&self, service: Service) -> Result<ServiceHandle, Error> {
        if self.core.is_shut_down() {
            return Err(Error::Shutdown);
        }
        service.validate().map_err(Error::Config)?;

        let id = ServiceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (command_tx, command_rx) = mpsc::channel(1);
        let (result_tx, result_rx) = oneshot::channel();

        self.services
            .lock()
            .expect("service table lock poisoned")
            .insert(id, command_tx);

        let task = tokio::spawn(run_service(
            self.core.clone(),
            self.db.clone(),
            id,
            service,
            self.hostname.clone(),
            command_rx,
            result_tx,
        ));
        self.service_tasks
            .lock()
            .expect("service task lock poisoned")
            .push(task);

        match result_rx.await {
            Ok(Ok(instance)) => Ok(ServiceHandle { id, instance }),
            Ok(Err(error)) => {
                self.forget(id);
                Err(error)
            }
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Deregister a service: goodbyes go out, then its records leave
    /// the database.  Resolves once the goodbye traffic is done.
    /// Deregistering an already-gone service is not an error.
    pub async fn deregister(&self, handle: ServiceHandle) -> Result<(), Error> {
        let command_tx = {
            self.services
                .lock()
                .expect("service table lock poisoned")
                .remove(&handle.id)
        };

        let Some(command_tx) = command_tx else {
            return Ok(());
        };

        let (done_tx, done_rx) = oneshot::channel();
        if command_tx
            .send(ServiceCommand::Deregister { done: done_tx })
            .await
            .is_err()
        {
            return Ok(());
        }

        let _ = done_rx.await;
        Ok(())
    }

    /// Shut down: every service says goodbye (bounded by a two
    /// second deadline), then the multicast memberships are
    /// released.  Incomplete goodbyes are logged, not errors.
    pub async fn shutdown(&self) {
        self.core.signal_shutdown();

        let tasks: Vec<JoinHandle<()>> = self
            .service_tasks
            .lock()
            .expect("service task lock poisoned")
            .drain(..)
            .collect();

        let deadline = TokioInstant::now() + SHUTDOWN_DEADLINE;
        for task in tasks {
            if timeout_at(deadline, task).await.is_err() {
                tracing::warn!("service did not finish its goodbye before the shutdown deadline");
            }
        }

        self.core.leave_groups();
        self.services
            .lock()
            .expect("service table lock poisoned")
            .clear();
    }

    /// A querier sharing this responder's socket and reader.
    pub fn querier(&self) -> Querier {
        Querier::from_core(self.core.clone())
    }

    /// A point-in-time copy of the engine counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.core.counters.snapshot()
    }

    fn forget(&self, id: ServiceId) {
        self.services
            .lock()
            .expect("service table lock poisoned")
            .remove(&id);
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Answer queries from the shared database: the steady-state duty of
/// the responder, shared by every announced service.
async fn run_answerer(core: Arc<EngineCore>, engine: Arc<QueryEngine>) {
    let mut inbound = core.subscribe();
    let mut shutdown = core.shutdown_signal();

    loop {
        let event = tokio::select! {
            event = inbound.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(%skipped, "query answerer lagged behind the reader");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = shutdown.changed() => return,
        };

        if event.message.header.is_response {
            continue;
        }

        for response in engine.handle_query(&event.message, event.source, event.ifindex) {
            tokio::spawn(send_response(core.clone(), response));
        }
    }
}

/// Wait out the aggregation delay, then emit one response.
async fn send_response(core: Arc<EngineCore>, response: OutboundResponse) {
    if !response.delay.is_zero() {
        sleep(response.delay).await;
    }

    let octets = match response.message.to_octets() {
        Ok(octets) => octets,
        Err(error) => {
            tracing::warn!(?error, "could not serialise response");
            return;
        }
    };

    let dest = match response.destination {
        Destination::Multicast => crate::net::MulticastSocket::multicast_destination(),
        Destination::Unicast(addr) => addr,
    };

    if let Err(error) = core.send_on_ifindex(&octets, dest, response.ifindex).await {
        tracing::debug!(?error, ?dest, "could not send response");
    }
}

/// How a probing cycle ended.
enum ProbeOutcome {
    Won,
    LostToProbe,
    LostToResponse,
    Deregistered(oneshot::Sender<()>),
    ShuttingDown,
    Failed(Error),
}

/// Why the idle state was left.
enum IdleOutcome {
    Conflict,
    /// The advertised interfaces changed address or membership; the
    /// record set must be rebuilt and re-announced.
    InterfacesChanged,
    Deregistered(oneshot::Sender<()>),
    ShuttingDown,
}

/// The per-service lifecycle task.
#[allow(clippy::too_many_arguments)]
async fn run_service(
    core: Arc<EngineCore>,
    db: SharedRecordDb,
    id: ServiceId,
    mut service: Service,
    hostname: String,
    mut commands: mpsc::Receiver<ServiceCommand>,
    result: oneshot::Sender<Result<String, Error>>,
) {
    let mut inbound = core.subscribe();
    let mut shutdown = core.shutdown_signal();
    let mut result = Some(result);
    let mut attempts = 0u32;

    db.add_service(id);

    loop {
        attempts += 1;
        if attempts > MAX_NAME_ATTEMPTS {
            db.remove_service(id);
            report(
                &mut result,
                Err(Error::ConflictUnresolved {
                    instance: service.instance.clone(),
                    attempts: attempts - 1,
                }),
            );
            return;
        }

        let advertised = advertised_interfaces(&core);
        if advertised.is_empty() {
            db.remove_service(id);
            report(&mut result, Err(Error::InterfaceGone { ifindex: 0 }));
            return;
        }

        let mut projected = match service::project(&service, &hostname, &advertised) {
            Ok(projected) => projected,
            Err(error) => {
                db.remove_service(id);
                report(&mut result, Err(Error::Config(error)));
                return;
            }
        };

        // tentative claim; a refusal means another local service
        // already holds the name, which is a conflict like any other
        if db.insert_records(id, &projected.all()).is_err() {
            tracing::debug!(instance = %service.instance, "name held locally, renaming");
            service = service.renamed();
            continue;
        }

        match probe(
            &core,
            &projected,
            &advertised,
            &mut inbound,
            &mut shutdown,
            &mut commands,
        )
        .await
        {
            ProbeOutcome::Won => {}
            ProbeOutcome::LostToProbe => {
                // the loser of a simultaneous probe defers for a
                // second before trying its next name
                tracing::info!(instance = %service.instance, "lost probe tie-break, renaming");
                reset_claim(&db, id);
                service = service.renamed();
                sleep(CONFLICT_DEFER).await;
                continue;
            }
            ProbeOutcome::LostToResponse => {
                // an established responder answered: rename without
                // the one second defer
                tracing::info!(instance = %service.instance, "name already taken, renaming");
                reset_claim(&db, id);
                service = service.renamed();
                continue;
            }
            ProbeOutcome::Deregistered(done) => {
                // never announced, so nothing to say goodbye for
                db.remove_service(id);
                report(&mut result, Err(Error::Cancelled));
                let _ = done.send(());
                return;
            }
            ProbeOutcome::ShuttingDown => {
                db.remove_service(id);
                report(&mut result, Err(Error::Shutdown));
                return;
            }
            ProbeOutcome::Failed(error) => {
                db.remove_service(id);
                report(&mut result, Err(error));
                return;
            }
        }

        db.set_announced(id);
        let mut advertised = advertised;
        if let Err(error) = announce(&core, &db, &projected, &advertised).await {
            db.remove_service(id);
            report(&mut result, Err(error));
            return;
        }
        tracing::info!(instance = %service.instance, "service announced");
        report(&mut result, Ok(service.instance.clone()));

        loop {
            match idle(
                &core,
                &projected,
                &advertised,
                &mut inbound,
                &mut shutdown,
                &mut commands,
            )
            .await
            {
                IdleOutcome::Conflict => {
                    // an unexpected peer claim in steady state: back
                    // to probing under a new name (RFC 6762 section 9)
                    tracing::info!(instance = %service.instance, "conflicting claim while announced, re-probing");
                    reset_claim(&db, id);
                    service = service.renamed();
                    break;
                }
                IdleOutcome::InterfacesChanged => {
                    let fresh = advertised_interfaces(&core);
                    if fresh.is_empty() {
                        // every advertised link is gone; keep the
                        // stale set and wait for one to come back
                        tracing::warn!(instance = %service.instance, "no usable interface remains");
                        continue;
                    }

                    if interface_returned(&advertised, &fresh) {
                        // a lost link came back: the records were
                        // never probed for uniqueness on it, so
                        // retract the stale set from the links that
                        // still carry it and go through probing
                        // again (RFC 6762 section 8.1)
                        tracing::info!(instance = %service.instance, "interface returned, saying goodbye and re-probing");
                        goodbye(&core, &db, &projected, &advertised).await;
                        reset_claim(&db, id);
                        attempts = 0;
                        break;
                    }

                    // a link went away or changed address: the
                    // service continues on what remains, with a
                    // rebuilt record set and a fresh announcement
                    match service::project(&service, &hostname, &fresh) {
                        Ok(fresh_projection) => {
                            reset_claim(&db, id);
                            if db.insert_records(id, &fresh_projection.all()).is_ok() {
                                db.set_announced(id);
                                projected = fresh_projection;
                                advertised = fresh;
                                tracing::info!(instance = %service.instance, "interfaces changed, re-announcing");
                                if let Err(error) =
                                    announce(&core, &db, &projected, &advertised).await
                                {
                                    tracing::warn!(%error, "re-announcement failed");
                                }
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, "could not re-project service records");
                        }
                    }
                }
                IdleOutcome::Deregistered(done) => {
                    goodbye(&core, &db, &projected, &advertised).await;
                    db.remove_service(id);
                    let _ = done.send(());
                    return;
                }
                IdleOutcome::ShuttingDown => {
                    goodbye(&core, &db, &projected, &advertised).await;
                    db.remove_service(id);
                    return;
                }
            }
        }
    }
}

/// The live view of the interfaces this engine advertises on: the
/// selection made at bind time, restricted to interfaces that still
/// exist with an IPv4 address.
fn advertised_interfaces(core: &EngineCore) -> Vec<Interface> {
    core.interfaces
        .list()
        .into_iter()
        .filter(|iface| {
            core.selected
                .iter()
                .any(|selected| selected.index == iface.index)
        })
        .collect()
}

/// A comparable digest of an interface set, for change detection.
fn interface_fingerprint(interfaces: &[Interface]) -> Vec<(u32, Vec<Ipv4Addr>)> {
    let mut fingerprint: Vec<(u32, Vec<Ipv4Addr>)> = interfaces
        .iter()
        .map(|iface| (iface.index, iface.addrs.clone()))
        .collect();
    fingerprint.sort();
    fingerprint
}

/// Whether `fresh` holds an interface `known` does not: a lost link
/// coming back (or a brand new one appearing), which forces a
/// goodbye and a fresh probe cycle.
fn interface_returned(known: &[Interface], fresh: &[Interface]) -> bool {
    fresh
        .iter()
        .any(|iface| !known.iter().any(|existing| existing.index == iface.index))
}

/// Resolve `register` exactly once; later outcomes are log-only.
fn report(result: &mut Option<oneshot::Sender<Result<String, Error>>>, outcome: Result<String, Error>) {
    if let Some(tx) = result.take() {
        let _ = tx.send(outcome);
    } else if let Err(error) = outcome {
        tracing::warn!(%error, "service failed after registration completed");
    }
}

/// Drop a tentative claim but keep the service tracked, for the next
/// attempt under a new name.
fn reset_claim(db: &SharedRecordDb, id: ServiceId) {
    db.remove_service(id);
    db.add_service(id);
}

/// Run the probe cycle: the configured number of probe queries,
/// 250 ms apart, watching for competing claims the whole time.
#[allow(clippy::too_many_arguments)]
async fn probe(
    core: &Arc<EngineCore>,
    projected: &ProjectedRecords,
    interfaces: &[Interface],
    inbound: &mut broadcast::Receiver<Arc<Inbound>>,
    shutdown: &mut watch::Receiver<bool>,
    commands: &mut mpsc::Receiver<ServiceCommand>,
) -> ProbeOutcome {
    let unique: Vec<ResourceRecord> = projected
        .unique
        .iter()
        .map(|pr| pr.record.clone())
        .collect();

    let message = build_probe(projected);
    let octets = match message.to_octets() {
        Ok(octets) => octets,
        Err(error) => {
            return ProbeOutcome::Failed(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                error.to_string(),
            )))
        }
    };

    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=PROBE_JITTER_MAX_MS));
    if let Some(outcome) = watch_for_conflicts(jitter, &unique, inbound, shutdown, commands).await
    {
        return outcome;
    }

    for _ in 0..core.config.probe_count {
        for iface in interfaces {
            // a probe send is retried once, then the failure goes
            // back to the registering caller
            if let Err(error) = core.send_probe_on(iface, &octets).await {
                return ProbeOutcome::Failed(error);
            }
        }
        if let Some(outcome) =
            watch_for_conflicts(PROBE_INTERVAL, &unique, inbound, shutdown, commands).await
        {
            return outcome;
        }
    }

    ProbeOutcome::Won
}

/// Sleep for `duration` while watching the inbound stream for claims
/// conflicting with `unique`.  Returns `None` when the wait ran to
/// completion without incident.
async fn watch_for_conflicts(
    duration: Duration,
    unique: &[ResourceRecord],
    inbound: &mut broadcast::Receiver<Arc<Inbound>>,
    shutdown: &mut watch::Receiver<bool>,
    commands: &mut mpsc::Receiver<ServiceCommand>,
) -> Option<ProbeOutcome> {
    let deadline = TokioInstant::now() + duration;

    loop {
        tokio::select! {
            () = sleep_until(deadline) => return None,

            _ = shutdown.changed() => return Some(ProbeOutcome::ShuttingDown),

            command = commands.recv() => match command {
                Some(ServiceCommand::Deregister { done }) => {
                    return Some(ProbeOutcome::Deregistered(done));
                }
                None => return Some(ProbeOutcome::ShuttingDown),
            },

            event = inbound.recv() => {
                let Ok(event) = event else { continue };
                match classify_conflict(&event.message, unique) {
                    Some(Conflict::LostProbeTieBreak) => {
                        return Some(ProbeOutcome::LostToProbe);
                    }
                    Some(Conflict::EstablishedClaim) => {
                        return Some(ProbeOutcome::LostToResponse);
                    }
                    None => {}
                }
            }
        }
    }
}

/// What an inbound message means for a probing service.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Conflict {
    /// A simultaneous prober offered greater record data: we lose.
    LostProbeTieBreak,

    /// An established responder answered for one of our names.
    EstablishedClaim,
}

/// Inspect an inbound message for claims on any of our unique
/// records.  Probe tie-breaks compare canonical RDATA
/// lexicographically, greater data winning (RFC 6762 section 8.2).
fn classify_conflict(message: &Message, unique: &[ResourceRecord]) -> Option<Conflict> {
    if message.header.is_response {
        for theirs in message.answers.iter().chain(&message.additional) {
            for ours in unique {
                if claims_same_name(theirs, ours) && !theirs.same_data(ours) {
                    return Some(Conflict::EstablishedClaim);
                }
            }
        }
        return None;
    }

    for theirs in &message.authority {
        for ours in unique {
            if claims_same_name(theirs, ours)
                && !theirs.same_data(ours)
                && theirs.tiebreak_cmp(ours) == CmpOrdering::Greater
            {
                return Some(Conflict::LostProbeTieBreak);
            }
        }
    }
    None
}

fn claims_same_name(theirs: &ResourceRecord, ours: &ResourceRecord) -> bool {
    theirs.name == ours.name
        && theirs.rtype_with_data.rtype() == ours.rtype_with_data.rtype()
}

/// The probe query: an ANY question per claimed name, with the
/// tentative records asserted in the authority section.
fn build_probe(projected: &ProjectedRecords) -> Message {
    let mut names: Vec<DomainName> = Vec::new();
    for pr in &projected.unique {
        if !names.contains(&pr.record.name) {
            names.push(pr.record.name.clone());
        }
    }

    let questions = names
        .into_iter()
        .map(|name| Question::new(name, QueryType::Wildcard))
        .collect();
    let authority = projected.unique.iter().map(|pr| pr.record.clone()).collect();

    Message::probe(questions, authority)
}

/// The announcement / goodbye record set for one interface.  An
/// announcement carries everything with the projected TTLs; a
/// goodbye carries the positive records with TTL zero and leaves the
/// NSEC assertions out.
fn build_record_set(
    projected: &ProjectedRecords,
    ifindex: u32,
    goodbye: bool,
) -> Message {
    let mut message = Message::response();

    for pr in projected.all() {
        if let Some(tagged) = pr.ifindex {
            if tagged != ifindex {
                continue;
            }
        }
        if goodbye && pr.record.rtype_with_data.rtype() == RecordType::NSEC {
            continue;
        }

        let mut record = pr.record;
        if goodbye {
            record.ttl = 0;
            record.cache_flush = false;
        }
        message.answers.push(record);
    }

    message
}

/// Send the full record set on every advertised interface, noting
/// each multicast for the rate limiter.
async fn send_record_set(
    core: &Arc<EngineCore>,
    db: &SharedRecordDb,
    projected: &ProjectedRecords,
    interfaces: &[Interface],
    goodbye: bool,
) -> Result<(), Error> {
    for iface in interfaces {
        let message = build_record_set(projected, iface.index, goodbye);
        let octets = message.to_octets().map_err(|error| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidData, error.to_string()))
        })?;

        core.send_multicast_on(iface, &octets).await?;

        let now = std::time::Instant::now();
        for record in &message.answers {
            db.note_multicast(&record_key(record), iface.index, now);
        }
    }
    Ok(())
}

/// Unsolicited announcements: at least two, a second apart (RFC 6762
/// section 8.3).
async fn announce(
    core: &Arc<EngineCore>,
    db: &SharedRecordDb,
    projected: &ProjectedRecords,
    interfaces: &[Interface],
) -> Result<(), Error> {
    for i in 0..core.config.announce_count.max(1) {
        if i > 0 {
            sleep(RECORD_SET_INTERVAL).await;
        }
        send_record_set(core, db, projected, interfaces, false).await?;
    }
    Ok(())
}

/// Goodbye responses with TTL zero (RFC 6762 section 10.1).  Failures
/// here are logged and abandoned: the records are leaving either way.
async fn goodbye(
    core: &Arc<EngineCore>,
    db: &SharedRecordDb,
    projected: &ProjectedRecords,
    interfaces: &[Interface],
) {
    for i in 0..core.config.goodbye_count.max(1) {
        if i > 0 {
            sleep(RECORD_SET_INTERVAL).await;
        }
        if let Err(error) = send_record_set(core, db, projected, interfaces, true).await {
            tracing::warn!(%error, "goodbye send failed");
            return;
        }
    }
}

/// Steady state: watch for conflicting claims, interface changes,
/// and lifecycle commands.  Queries are answered by the shared
/// answerer task, not here.
async fn idle(
    core: &Arc<EngineCore>,
    projected: &ProjectedRecords,
    advertised: &[Interface],
    inbound: &mut broadcast::Receiver<Arc<Inbound>>,
    shutdown: &mut watch::Receiver<bool>,
    commands: &mut mpsc::Receiver<ServiceCommand>,
) -> IdleOutcome {
    let unique: Vec<ResourceRecord> = projected
        .unique
        .iter()
        .map(|pr| pr.record.clone())
        .collect();

    let baseline = interface_fingerprint(advertised);
    let mut poll = tokio::time::interval_at(
        TokioInstant::now() + INTERFACE_POLL_INTERVAL,
        INTERFACE_POLL_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => return IdleOutcome::ShuttingDown,

            command = commands.recv() => match command {
                Some(ServiceCommand::Deregister { done }) => {
                    return IdleOutcome::Deregistered(done);
                }
                None => return IdleOutcome::ShuttingDown,
            },

            _ = poll.tick() => {
                if interface_fingerprint(&advertised_interfaces(core)) != baseline {
                    return IdleOutcome::InterfacesChanged;
                }
            }

            event = inbound.recv() => {
                let Ok(event) = event else { continue };
                if event.message.header.is_response
                    && classify_conflict(&event.message, &unique)
                        == Some(Conflict::EstablishedClaim)
                {
                    return IdleOutcome::Conflict;
                }
            }
        }
    }
}

#[cfg(unix)]
fn machine_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            // the short name: mDNS hostnames live under .local
            let short = name.split('.').next().unwrap_or(name);
            if !short.is_empty() {
                return short.to_string();
            }
        }
    }
    "localhost".to_string()
}

#[cfg(not(unix))]
fn machine_hostname() -> String {
    "localhost".to_string()
}
