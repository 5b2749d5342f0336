//! One-shot queries: ask once on every interface, collect what comes
//! back before the deadline.

use bytes::Bytes;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant as TokioInstant};

use mdns_types::protocol::types::*;

use crate::config::Config;
use crate::engine::{run_reader, EngineCore};
use crate::error::Error;

/// Deduplication identity of an answer: owner name (compared
/// case-insensitively), numeric type, canonical RDATA.
type AnswerKey = (DomainName, u16, Bytes);

/// The mDNS querier.
///
/// A standalone querier owns its own socket; one obtained from
/// [`crate::Responder::querier`] shares the responder's.
pub struct Querier {
    core: Arc<EngineCore>,
    owns_core: bool,
}

impl Querier {
    /// Bind a socket of our own and start a reader for it.  Must be
    /// called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self, Error> {
        let core = EngineCore::bind(config)?;
        tokio::spawn(run_reader(core.clone()));
        Ok(Self {
            core,
            owns_core: true,
        })
    }

    pub(crate) fn from_core(core: Arc<EngineCore>) -> Self {
        Self {
            core,
            owns_core: false,
        }
    }

    /// Ask one question on every selected interface and collect the
    /// answers that arrive before the deadline, deduplicated.  A
    /// deadline with no answers is an empty list, not an error;
    /// errors are reserved for local I/O failures and shutdown.
    pub async fn query(
        &self,
        name: DomainName,
        qtype: QueryType,
        deadline: Duration,
    ) -> Result<Vec<ResourceRecord>, Error> {
        if self.core.is_shut_down() {
            return Err(Error::Shutdown);
        }

        let question = Question::new(name, qtype);
        // subscribe before sending so an instant answer is not missed
        let mut inbound = self.core.subscribe();
        let mut shutdown = self.core.shutdown_signal();

        let message = Message::query(vec![question.clone()]);
        let octets = message.to_octets().map_err(|error| {
            Error::Io(io::Error::new(io::ErrorKind::InvalidData, error.to_string()))
        })?;
        self.core.send_multicast_all(&octets).await?;

        let deadline = TokioInstant::now() + deadline;
        let mut seen: HashSet<AnswerKey> = HashSet::new();
        let mut answers: Vec<ResourceRecord> = Vec::new();

        loop {
            tokio::select! {
                () = sleep_until(deadline) => break,

                _ = shutdown.changed() => return Err(Error::Shutdown),

                event = inbound.recv() => {
                    let Ok(event) = event else { continue };
                    if event.message.header.is_response {
                        collect_matching(&event.message, &question, &mut seen, &mut answers);
                    }
                }
            }
        }

        Ok(answers)
    }

    /// Shut down a standalone querier's socket and reader.  A shared
    /// querier leaves that to its responder.
    pub fn shutdown(&self) {
        if self.owns_core {
            self.core.signal_shutdown();
            self.core.leave_groups();
        }
    }
}

impl std::fmt::Debug for Querier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Querier")
            .field("owns_core", &self.owns_core)
            .finish_non_exhaustive()
    }
}

/// Pull the records answering `question` out of a response,
/// deduplicating against everything collected so far.
fn collect_matching(
    message: &Message,
    question: &Question,
    seen: &mut HashSet<AnswerKey>,
    answers: &mut Vec<ResourceRecord>,
) {
    for record in &message.answers {
        if !record.matches(question) {
            continue;
        }

        let key = (
            record.name.clone(),
            u16::from(record.rtype_with_data.rtype()),
            record.rdata_canonical(),
        );
        if seen.insert(key) {
            answers.push(record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdns_types::protocol::types::test_util::*;

    fn browse_question() -> Question {
        Question::new(
            domain("_ipp._tcp.local."),
            QueryType::Record(RecordType::PTR),
        )
    }

    #[test]
    fn collects_only_records_matching_the_question() {
        let mut response = Message::response();
        response
            .answers
            .push(ptr_record("_ipp._tcp.local.", "Printer._ipp._tcp.local."));
        response
            .answers
            .push(ptr_record("_http._tcp.local.", "Web._http._tcp.local."));
        response
            .answers
            .push(srv_record("Printer._ipp._tcp.local.", 631, "mac.local."));

        let mut seen = HashSet::new();
        let mut answers = Vec::new();
        collect_matching(&response, &browse_question(), &mut seen, &mut answers);

        assert_eq!(1, answers.len());
        assert_eq!(domain("_ipp._tcp.local."), answers[0].name);
    }

    #[test]
    fn deduplicates_across_responses() {
        let mut response = Message::response();
        response
            .answers
            .push(ptr_record("_ipp._tcp.local.", "Printer._ipp._tcp.local."));

        // the same answer spelled differently, as a repeat
        // transmission might
        let mut echo = Message::response();
        echo.answers
            .push(ptr_record("_IPP._tcp.LOCAL.", "printer._ipp._tcp.local."));

        let mut seen = HashSet::new();
        let mut answers = Vec::new();
        collect_matching(&response, &browse_question(), &mut seen, &mut answers);
        collect_matching(&echo, &browse_question(), &mut seen, &mut answers);

        assert_eq!(1, answers.len());
    }

    #[test]
    fn distinct_instances_both_survive_dedup() {
        let mut response = Message::response();
        response
            .answers
            .push(ptr_record("_ipp._tcp.local.", "Web._ipp._tcp.local."));
        response
            .answers
            .push(ptr_record("_ipp._tcp.local.", "API._ipp._tcp.local."));

        let mut seen = HashSet::new();
        let mut answers = Vec::new();
        collect_matching(&response, &browse_question(), &mut seen, &mut answers);

        assert_eq!(2, answers.len());
    }

    #[test]
    fn wildcard_question_collects_every_type() {
        let mut response = Message::response();
        response
            .answers
            .push(srv_record("Printer._ipp._tcp.local.", 631, "mac.local."));
        response
            .answers
            .push(txt_record("Printer._ipp._tcp.local.", &[b"rp=x"]));

        let question = Question::new(domain("Printer._ipp._tcp.local."), QueryType::Wildcard);
        let mut seen = HashSet::new();
        let mut answers = Vec::new();
        collect_matching(&response, &question, &mut seen, &mut answers);

        assert_eq!(2, answers.len());
    }
}
