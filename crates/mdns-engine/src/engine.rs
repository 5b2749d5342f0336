//! The shared core of the engine: the multicast socket, the selected
//! interfaces, and the single reader task that parses datagrams and
//! fans them out to whoever is listening (service state machines,
//! the query-answering task, querier waiters).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use mdns_types::protocol::types::{Message, MAX_PACKET_SIZE};

use crate::config::{Config, InterfaceSelection};
use crate::counters::EngineCounters;
use crate::error::{ConfigError, Error};
use crate::iface::{Interface, InterfaceCache};
use crate::net::MulticastSocket;

/// How many inbound messages may sit unconsumed in the fan-out
/// channel.  mDNS is lossy by design: a lagging subscriber skips
/// ahead rather than stalling the reader.
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Attempts per datagram before a send error is surfaced.
const SEND_ATTEMPTS: u32 = 3;

/// Attempts per probe datagram: a failed probe send is retried once,
/// then the failure goes straight back to the registering caller.
const PROBE_SEND_ATTEMPTS: u32 = 2;

/// A parsed inbound datagram with its link metadata.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub message: Message,
    pub source: SocketAddr,
    pub ifindex: u32,
}

pub(crate) struct EngineCore {
    pub socket: MulticastSocket,
    pub interfaces: InterfaceCache,
    pub counters: Arc<EngineCounters>,
    pub config: Config,
    /// The interfaces joined at startup; the advertised set.
    pub selected: Vec<Interface>,
    pub inbound_tx: broadcast::Sender<Arc<Inbound>>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl EngineCore {
    /// Bind the socket, pick the interfaces, and join the multicast
    /// group on each.  Must be called from within a tokio runtime.
    pub fn bind(config: Config) -> Result<Arc<Self>, Error> {
        let interfaces = InterfaceCache::new(false);
        let selected = select_interfaces(&interfaces.list(), &config.interfaces)?;

        let socket = MulticastSocket::bind(config.multicast_loopback)?;
        for iface in &selected {
            let addr = iface.primary_addr();
            if let Err(error) = socket.join(addr) {
                tracing::warn!(name = %iface.name, %addr, ?error, "could not join multicast group");
            } else {
                tracing::debug!(name = %iface.name, %addr, "joined multicast group");
            }
        }

        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            socket,
            interfaces,
            counters: Arc::new(EngineCounters::default()),
            config,
            selected,
            inbound_tx,
            shutdown_tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Inbound>> {
        self.inbound_tx.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal shutdown to every task watching the channel.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Release the multicast memberships.  Called after the goodbye
    /// traffic has gone out.
    pub fn leave_groups(&self) {
        for iface in &self.selected {
            let _ = self.socket.leave(iface.primary_addr());
        }
    }

    /// Send an encoded message out of one specific interface.
    pub async fn send_multicast_on(
        &self,
        iface: &Interface,
        octets: &[u8],
    ) -> Result<(), Error> {
        let mut bytes = octets.to_vec();
        self.send_with_retry(
            &mut bytes,
            MulticastSocket::multicast_destination(),
            Some(iface.primary_addr()),
            SEND_ATTEMPTS,
        )
        .await
    }

    /// Send a probe query out of one specific interface.  Probing
    /// has a stricter failure budget than steady-state traffic: one
    /// retry, then the error surfaces.
    pub async fn send_probe_on(&self, iface: &Interface, octets: &[u8]) -> Result<(), Error> {
        let mut bytes = octets.to_vec();
        self.send_with_retry(
            &mut bytes,
            MulticastSocket::multicast_destination(),
            Some(iface.primary_addr()),
            PROBE_SEND_ATTEMPTS,
        )
        .await
    }

    /// Send an encoded message out of every advertised interface.
    pub async fn send_multicast_all(&self, octets: &[u8]) -> Result<(), Error> {
        let dest = MulticastSocket::multicast_destination();
        for iface in &self.selected {
            let mut bytes = octets.to_vec();
            self.send_with_retry(&mut bytes, dest, Some(iface.primary_addr()), SEND_ATTEMPTS)
                .await?;
        }
        Ok(())
    }

    /// Send out of the interface with the given index, or the system
    /// default when the index is zero or unknown.
    pub async fn send_on_ifindex(
        &self,
        octets: &[u8],
        dest: SocketAddr,
        ifindex: u32,
    ) -> Result<(), Error> {
        let out_addr = if ifindex == 0 {
            None
        } else {
            self.selected
                .iter()
                .find(|iface| iface.index == ifindex)
                .map(Interface::primary_addr)
        };
        let mut bytes = octets.to_vec();
        self.send_with_retry(&mut bytes, dest, out_addr, SEND_ATTEMPTS)
            .await
    }

    /// Retry transient failures with a short exponential backoff, up
    /// to `max_attempts`, then propagate the error upward.  A failed
    /// send also invalidates the interface snapshot, since a
    /// vanished interface is the common cause.
    async fn send_with_retry(
        &self,
        bytes: &mut [u8],
        dest: SocketAddr,
        out_addr: Option<Ipv4Addr>,
        max_attempts: u32,
    ) -> Result<(), Error> {
        let mut backoff = Duration::from_millis(10);
        let mut attempt = 1;

        loop {
            match self.socket.send_to(bytes, dest, out_addr).await {
                Ok(_) => {
                    self.counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(error) => {
                    self.interfaces.invalidate();
                    if attempt >= max_attempts {
                        return Err(Error::Io(error));
                    }
                    tracing::debug!(?error, %dest, %attempt, "send failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}

/// The single reader: owns all receives on the shared socket and
/// fans parsed messages out to subscribers.
pub(crate) async fn run_reader(core: Arc<EngineCore>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut shutdown = core.shutdown_signal();

    loop {
        tokio::select! {
            received = core.socket.recv_from(&mut buf) => match received {
                Ok((len, source, ifindex)) => {
                    core.counters.datagrams_received.fetch_add(1, Ordering::Relaxed);
                    match Message::from_octets(&buf[..len]) {
                        Ok(message) => {
                            let _ = core.inbound_tx.send(Arc::new(Inbound {
                                message,
                                source,
                                ifindex,
                            }));
                        }
                        Err(error) => {
                            core.counters.malformed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(%source, %error, "dropping malformed datagram");
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(?error, "mDNS receive error");
                    core.interfaces.invalidate();
                }
            },

            _ = shutdown.changed() => return,
        }
    }
}

/// Resolve the configured interface selection against what the host
/// actually has.
fn select_interfaces(
    available: &[Interface],
    selection: &InterfaceSelection,
) -> Result<Vec<Interface>, ConfigError> {
    let selected: Vec<Interface> = match selection {
        InterfaceSelection::Default => available.to_vec(),
        InterfaceSelection::Named(names) => available
            .iter()
            .filter(|iface| names.iter().any(|name| *name == iface.name))
            .cloned()
            .collect(),
    };

    if selected.is_empty() {
        Err(ConfigError::NoUsableInterface)
    } else {
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(index: u32, name: &str) -> Interface {
        Interface {
            index,
            name: name.to_string(),
            addrs: vec![Ipv4Addr::new(10, 0, 0, index as u8)],
        }
    }

    #[test]
    fn default_selection_takes_everything() {
        let available = [iface(2, "eth0"), iface(3, "wlan0")];
        let selected = select_interfaces(&available, &InterfaceSelection::Default).unwrap();
        assert_eq!(2, selected.len());
    }

    #[test]
    fn named_selection_filters_by_name() {
        let available = [iface(2, "eth0"), iface(3, "wlan0")];
        let selected = select_interfaces(
            &available,
            &InterfaceSelection::Named(vec!["wlan0".to_string()]),
        )
        .unwrap();
        assert_eq!(vec![iface(3, "wlan0")], selected);
    }

    #[test]
    fn empty_selection_is_a_config_error() {
        let available = [iface(2, "eth0")];
        assert_eq!(
            Err(ConfigError::NoUsableInterface),
            select_interfaces(
                &available,
                &InterfaceSelection::Named(vec!["tun0".to_string()])
            )
        );
        assert_eq!(
            Err(ConfigError::NoUsableInterface),
            select_interfaces(&[], &InterfaceSelection::Default)
        );
    }
}
