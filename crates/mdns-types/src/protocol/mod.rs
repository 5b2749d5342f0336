//! DNS wire format with the Multicast DNS extensions: the cache-flush
//! bit on record classes, the QU bit on question classes, and the
//! record types used by DNS Service Discovery.

pub mod deserialise;
pub mod serialise;
pub mod types;
