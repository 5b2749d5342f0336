//! A link-local Multicast DNS responder and querier (RFC 6762) with
//! DNS Service Discovery record handling (RFC 6763).
//!
//! The [`Responder`] advertises services on the local network: each
//! registered service is probed for uniqueness, announced, defended
//! against conflicting claims, and sent off with a goodbye when
//! deregistered.  The [`Querier`] issues one-shot questions and
//! collects the answers that arrive before a deadline.

#![warn(clippy::pedantic)]
// False positives for `bytes::Bytes`
#![allow(clippy::mutable_key_type)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod config;
pub mod counters;
pub mod db;
pub mod error;
pub mod iface;
pub mod net;
pub mod querier;
pub mod query;
pub mod responder;
pub mod service;

mod engine;

pub use config::{Config, InterfaceSelection};
pub use counters::CountersSnapshot;
pub use error::{ConfigError, Error};
pub use querier::Querier;
pub use responder::{Responder, ServiceHandle};
pub use service::Service;
