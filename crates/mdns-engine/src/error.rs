//! The error surface of the engine.
//!
//! Per-datagram failures are absorbed (counted and logged, the
//! datagram dropped); only lifecycle operations return errors to the
//! caller, and of those only `register` can fail for protocol
//! reasons.

use std::fmt;
use std::io;

/// Errors surfaced by the public operations of the engine.
#[derive(Debug)]
pub enum Error {
    /// A datagram failed to parse.  Never returned from public
    /// operations; carried so callers inspecting logs and counters
    /// can name the failure.
    Malformed(mdns_types::protocol::deserialise::Error),

    /// An invalid service definition, rejected synchronously at
    /// `register`.
    Config(ConfigError),

    /// Probing kept losing: the service was renamed more than the
    /// permitted number of times without winning its name.
    ConflictUnresolved { instance: String, attempts: u32 },

    /// A socket operation failed after retries.
    Io(io::Error),

    /// The interface a service was advertising on went away.
    InterfaceGone { ifindex: u32 },

    /// The caller cancelled the operation.
    Cancelled,

    /// The engine has shut down; no further operations are possible.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Malformed(error) => write!(f, "malformed message: {error}"),
            Error::Config(error) => write!(f, "invalid configuration: {error}"),
            Error::ConflictUnresolved { instance, attempts } => write!(
                f,
                "could not claim a unique name for '{instance}' after {attempts} attempts"
            ),
            Error::Io(error) => write!(f, "i/o error: {error}"),
            Error::InterfaceGone { ifindex } => {
                write!(f, "interface {ifindex} is no longer usable")
            }
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Shutdown => write!(f, "engine has shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Malformed(error) => Some(error),
            Error::Config(error) => Some(error),
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

/// Ways a service definition or engine configuration can be invalid.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The instance name is empty.
    EmptyInstanceName,

    /// The instance name does not fit in a single 63-octet label.
    InstanceNameTooLong,

    /// The service type is not of the `_name._tcp` / `_name._udp`
    /// shape.
    InvalidServiceType(String),

    /// A TXT key is empty, longer than nine octets (RFC 6763 section
    /// 6.4), or contains `=` or non-printable ASCII.
    InvalidTxtKey(String),

    /// The service port is zero.
    ZeroPort,

    /// The hostname is not a valid domain name.
    InvalidHostName(String),

    /// No usable IPv4 interface matched the interface selection.
    NoUsableInterface,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::EmptyInstanceName => write!(f, "instance name is empty"),
            ConfigError::InstanceNameTooLong => {
                write!(f, "instance name is longer than 63 octets")
            }
            ConfigError::InvalidServiceType(t) => {
                write!(f, "'{t}' is not a '_name._tcp' or '_name._udp' service type")
            }
            ConfigError::InvalidTxtKey(k) => write!(f, "'{k}' is not a valid TXT key"),
            ConfigError::ZeroPort => write!(f, "service port is zero"),
            ConfigError::InvalidHostName(h) => write!(f, "'{h}' is not a valid hostname"),
            ConfigError::NoUsableInterface => {
                write!(f, "no usable IPv4 multicast interface")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
