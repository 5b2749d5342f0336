//! Interface enumeration and `ifindex -> IPv4` resolution.
//!
//! Answers to an mDNS query must only name addresses valid on the
//! link the query arrived from (RFC 6762 section 15), so the engine
//! needs a live view of which interface holds which address.  The
//! view is a snapshot refreshed at most once a second, with a forced
//! refresh when a socket error suggests an interface went away.

use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long an enumeration snapshot stays fresh.
const SNAPSHOT_TTL: Duration = Duration::from_secs(1);

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] interface cache mutex poisoned, cannot recover from this - aborting";

/// One network interface holding at least one IPv4 address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub addrs: Vec<Ipv4Addr>,
}

impl Interface {
    /// The interface's primary IPv4 address.
    #[allow(clippy::missing_panics_doc)]
    pub fn primary_addr(&self) -> Ipv4Addr {
        // an `Interface` is only constructed with at least one address
        *self.addrs.first().unwrap()
    }
}

/// A shared, self-refreshing view of the host's IPv4 interfaces.
///
/// Invoking `clone` gives a new handle to the same underlying
/// snapshot.
#[derive(Debug, Clone)]
pub struct InterfaceCache {
    inner: Arc<Mutex<CacheInner>>,
    include_loopback: bool,
}

#[derive(Debug)]
struct CacheInner {
    snapshot: Vec<Interface>,
    refreshed_at: Option<Instant>,
}

impl InterfaceCache {
    pub fn new(include_loopback: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                snapshot: Vec::new(),
                refreshed_at: None,
            })),
            include_loopback,
        }
    }

    /// Enumerate up, multicast-capable, non-point-to-point interfaces
    /// holding at least one IPv4 address.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn list(&self) -> Vec<Interface> {
        let mut inner = self.inner.lock().expect(MUTEX_POISON_MESSAGE);

        let stale = match inner.refreshed_at {
            Some(at) => at.elapsed() > SNAPSHOT_TTL,
            None => true,
        };
        if stale {
            match enumerate(self.include_loopback) {
                Ok(snapshot) => {
                    inner.snapshot = snapshot;
                    inner.refreshed_at = Some(Instant::now());
                }
                Err(error) => {
                    tracing::warn!(?error, "could not enumerate interfaces");
                }
            }
        }

        inner.snapshot.clone()
    }

    /// The first IPv4 address bound to the given interface index,
    /// `None` for an unknown index.
    pub fn ipv4_for(&self, ifindex: u32) -> Option<Ipv4Addr> {
        self.list()
            .iter()
            .find(|iface| iface.index == ifindex)
            .map(Interface::primary_addr)
    }

    /// The host-default IPv4, used when a datagram arrived with no
    /// interface metadata.
    pub fn default_ipv4(&self) -> Option<Ipv4Addr> {
        self.list().first().map(Interface::primary_addr)
    }

    /// Drop the snapshot, forcing the next lookup to re-enumerate.
    /// Called on socket errors that look like an interface went away.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn invalidate(&self) {
        self.inner
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .refreshed_at = None;
    }
}

#[cfg(unix)]
fn enumerate(include_loopback: bool) -> io::Result<Vec<Interface>> {
    use std::ffi::CStr;

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut out: Vec<Interface> = Vec::new();
    let mut cursor = ifap;
    while !cursor.is_null() {
        // safe: the list from getifaddrs is well-formed until freed
        unsafe {
            let ifa = &*cursor;
            cursor = ifa.ifa_next;

            if ifa.ifa_addr.is_null() {
                continue;
            }
            if i32::from((*ifa.ifa_addr).sa_family) != libc::AF_INET {
                continue;
            }

            let up = libc::IFF_UP as libc::c_uint;
            let multicast = libc::IFF_MULTICAST as libc::c_uint;
            let pointopoint = libc::IFF_POINTOPOINT as libc::c_uint;
            let loopback = libc::IFF_LOOPBACK as libc::c_uint;

            if ifa.ifa_flags & up == 0 || ifa.ifa_flags & multicast == 0 {
                continue;
            }
            if ifa.ifa_flags & pointopoint != 0 {
                continue;
            }
            if !include_loopback && ifa.ifa_flags & loopback != 0 {
                continue;
            }

            let index = libc::if_nametoindex(ifa.ifa_name);
            if index == 0 {
                continue;
            }

            let sin = &*ifa.ifa_addr.cast::<libc::sockaddr_in>();
            let addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));

            if let Some(existing) = out.iter_mut().find(|iface| iface.index == index) {
                existing.addrs.push(addr);
            } else {
                out.push(Interface {
                    index,
                    name: CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned(),
                    addrs: vec![addr],
                });
            }
        }
    }

    unsafe { libc::freeifaddrs(ifap) };
    Ok(out)
}

#[cfg(not(unix))]
fn enumerate(_include_loopback: bool) -> io::Result<Vec<Interface>> {
    Ok(Vec::new())
}
