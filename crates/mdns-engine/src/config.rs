//! Engine configuration.

/// Which interfaces to advertise and listen on.
#[derive(Debug, Clone, Default)]
pub enum InterfaceSelection {
    /// All IPv4-capable, multicast-capable, non-loopback,
    /// non-point-to-point interfaces that are up at start.
    #[default]
    Default,

    /// An explicit list of interface names (e.g. `eth0`).  Names not
    /// present at start are ignored; if none match, construction
    /// fails with a configuration error.
    Named(Vec<String>),
}

/// Configuration shared by the responder and the querier.
///
/// The defaults are the protocol-mandated values; they are
/// configurable mostly for tests, which want shorter and more
/// deterministic schedules.
#[derive(Debug, Clone)]
pub struct Config {
    pub interfaces: InterfaceSelection,

    /// Whether multicast datagrams loop back to the sending host.
    pub multicast_loopback: bool,

    /// Probes sent before a name is considered won (RFC 6762
    /// section 8.1 says three).
    pub probe_count: u32,

    /// Unsolicited announcements sent after probing (at least two,
    /// RFC 6762 section 8.3).
    pub announce_count: u32,

    /// Goodbye responses sent on deregistration (RFC 6762 section
    /// 10.1).
    pub goodbye_count: u32,

    /// Bounds, in milliseconds, of the random delay inserted before a
    /// multicast response to a shared-record query (RFC 6762
    /// section 6).
    pub response_delay_range_ms: (u64, u64),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: InterfaceSelection::Default,
            multicast_loopback: false,
            probe_count: 3,
            announce_count: 2,
            goodbye_count: 2,
            response_delay_range_ms: (20, 120),
        }
    }
}
