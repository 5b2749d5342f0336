//! User-facing service definitions and their projection to DNS-SD
//! record sets.
//!
//! A registered service becomes, on the wire:
//!
//! - one PTR `<type>.local -> <instance>.<type>.local` (shared)
//! - one SRV `<instance>.<type>.local -> <host>:<port>` (unique)
//! - one TXT `<instance>.<type>.local` (unique)
//! - one A `<host>.local` per advertised interface (unique)
//! - one NSEC per unique owner name, asserting which types exist
//!
//! Unique records carry the cache-flush bit; the shared PTR never
//! does.  TTLs follow RFC 6762 section 10: 120 seconds for records
//! naming a host, 4500 for the long-lived PTR and TXT.

use bytes::Bytes;
use std::collections::BTreeMap;

use mdns_types::protocol::types::*;

use crate::error::ConfigError;
use crate::iface::Interface;

/// Maximum length of a TXT key (RFC 6763 section 6.4).
const TXT_KEY_MAX_LEN: usize = 9;

/// A stable numeric identity for a registered service.  Records in
/// the database refer to their owning service by this, never by
/// pointer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ServiceId(pub u64);

/// A service to advertise, as supplied by the caller.
#[derive(Debug, Clone)]
pub struct Service {
    /// Instance name, e.g. `Printer`.  A single label: dots are
    /// allowed and are not structure.
    pub instance: String,

    /// Service type, e.g. `_ipp._tcp`.
    pub service_type: String,

    /// TCP or UDP port the service listens on.
    pub port: u16,

    /// Hostname to advertise, without the `.local` suffix; `None`
    /// uses the machine hostname.
    pub hostname: Option<String>,

    /// TXT metadata, in key order on the wire.
    pub txt: BTreeMap<String, String>,
}

impl Service {
    /// Check the definition against the registration rules.  This is
    /// the only protocol-level validation: everything else about a
    /// service is negotiated on the wire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance.is_empty() {
            return Err(ConfigError::EmptyInstanceName);
        }
        if self.instance.len() > LABEL_MAX_LEN {
            return Err(ConfigError::InstanceNameTooLong);
        }

        if !valid_service_type(&self.service_type) {
            return Err(ConfigError::InvalidServiceType(self.service_type.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }

        if let Some(hostname) = &self.hostname {
            if hostname.is_empty()
                || hostname.len() > LABEL_MAX_LEN
                || hostname.contains('.')
            {
                return Err(ConfigError::InvalidHostName(hostname.clone()));
            }
        }

        for key in self.txt.keys() {
            let printable_ascii = key
                .bytes()
                .all(|b| (0x20..=0x7E).contains(&b) && b != b'=');
            if key.is_empty() || key.len() > TXT_KEY_MAX_LEN || !printable_ascii {
                return Err(ConfigError::InvalidTxtKey(key.clone()));
            }
        }

        Ok(())
    }

    /// The same service under the next fallback name: `Printer`
    /// becomes `Printer-2`, `Printer-2` becomes `Printer-3`, and so
    /// on (RFC 6762 section 9).
    pub fn renamed(&self) -> Self {
        let mut next = self.clone();
        next.instance = next_instance_name(&self.instance);
        next
    }
}

/// `Printer` -> `Printer-2` -> `Printer-3` -> ...
fn next_instance_name(instance: &str) -> String {
    if let Some((stem, suffix)) = instance.rsplit_once('-') {
        if let Ok(n) = suffix.parse::<u32>() {
            if n >= 2 {
                return format!("{stem}-{}", n + 1);
            }
        }
    }
    format!("{instance}-2")
}

fn valid_service_type(service_type: &str) -> bool {
    let mut labels = service_type.split('.');
    let (Some(name), Some(proto), None) = (labels.next(), labels.next(), labels.next()) else {
        return false;
    };

    name.len() >= 2
        && name.len() <= LABEL_MAX_LEN
        && name.starts_with('_')
        && (proto == "_tcp" || proto == "_udp")
}

/// A service's record set, projected for a concrete set of
/// interfaces.
#[derive(Debug, Clone)]
pub struct ProjectedRecords {
    /// The shared PTR from the service type to the instance.
    pub ptr: ResourceRecord,

    /// The unique records the service must win by probing: SRV and
    /// TXT at the instance name, one A per advertised interface.
    pub unique: Vec<ProjectedRecord>,

    /// NSEC negative assertions, one per unique owner name.
    pub nsec: Vec<ResourceRecord>,
}

/// A record plus the interface it is specific to (`None` for records
/// valid on every advertised interface).
#[derive(Debug, Clone)]
pub struct ProjectedRecord {
    pub record: ResourceRecord,
    pub ifindex: Option<u32>,
}

impl ProjectedRecords {
    /// All records, interface-tagged, in announcement order.
    pub fn all(&self) -> Vec<ProjectedRecord> {
        let mut out = Vec::with_capacity(self.unique.len() + self.nsec.len() + 1);
        out.push(ProjectedRecord {
            record: self.ptr.clone(),
            ifindex: None,
        });
        out.extend(self.unique.iter().cloned());
        out.extend(self.nsec.iter().map(|record| ProjectedRecord {
            record: record.clone(),
            ifindex: None,
        }));
        out
    }
}

/// Project a validated service onto the advertised interfaces.
///
/// # Errors
///
/// If a name assembled from the parts does not form a valid domain
/// name (e.g. the instance plus type overflows the 255-octet limit).
pub fn project(
    service: &Service,
    default_hostname: &str,
    interfaces: &[Interface],
) -> Result<ProjectedRecords, ConfigError> {
    let type_name = service_type_name(&service.service_type)?;
    let instance_name = instance_name(&service.instance, &service.service_type)?;
    let host = service
        .hostname
        .clone()
        .unwrap_or_else(|| default_hostname.to_string());
    let host_name = host_name(&host)?;

    let ptr = ResourceRecord {
        name: type_name,
        rtype_with_data: RecordTypeWithData::PTR {
            ptrname: instance_name.clone(),
        },
        rclass: RecordClass::IN,
        cache_flush: false,
        ttl: SERVICE_RECORD_TTL,
    };

    let mut unique = vec![
        ProjectedRecord {
            record: ResourceRecord {
                name: instance_name.clone(),
                rtype_with_data: RecordTypeWithData::SRV {
                    priority: 0,
                    weight: 0,
                    port: service.port,
                    target: host_name.clone(),
                },
                rclass: RecordClass::IN,
                cache_flush: true,
                ttl: HOST_RECORD_TTL,
            },
            ifindex: None,
        },
        ProjectedRecord {
            record: ResourceRecord {
                name: instance_name.clone(),
                rtype_with_data: RecordTypeWithData::TXT {
                    strings: txt_strings(&service.txt),
                },
                rclass: RecordClass::IN,
                cache_flush: true,
                ttl: SERVICE_RECORD_TTL,
            },
            ifindex: None,
        },
    ];

    for iface in interfaces {
        unique.push(ProjectedRecord {
            record: ResourceRecord {
                name: host_name.clone(),
                rtype_with_data: RecordTypeWithData::A {
                    address: iface.primary_addr(),
                },
                rclass: RecordClass::IN,
                cache_flush: true,
                ttl: HOST_RECORD_TTL,
            },
            ifindex: Some(iface.index),
        });
    }

    let nsec = vec![
        ResourceRecord {
            name: instance_name.clone(),
            rtype_with_data: RecordTypeWithData::NSEC {
                next_name: instance_name,
                types: vec![RecordType::TXT, RecordType::SRV],
            },
            rclass: RecordClass::IN,
            cache_flush: true,
            ttl: HOST_RECORD_TTL,
        },
        ResourceRecord {
            name: host_name.clone(),
            rtype_with_data: RecordTypeWithData::NSEC {
                next_name: host_name,
                types: vec![RecordType::A],
            },
            rclass: RecordClass::IN,
            cache_flush: true,
            ttl: HOST_RECORD_TTL,
        },
    ];

    Ok(ProjectedRecords { ptr, unique, nsec })
}

/// `_ipp._tcp` -> `_ipp._tcp.local.`
fn service_type_name(service_type: &str) -> Result<DomainName, ConfigError> {
    DomainName::from_dotted_string(&format!("{service_type}.local"))
        .ok_or_else(|| ConfigError::InvalidServiceType(service_type.to_string()))
}

/// `Printer` + `_ipp._tcp` -> `Printer._ipp._tcp.local.`, with the
/// instance as one label so embedded dots survive.
fn instance_name(instance: &str, service_type: &str) -> Result<DomainName, ConfigError> {
    let type_name = service_type_name(service_type)?;

    let mut labels = vec![Label::try_from(instance.as_bytes())
        .map_err(|_| ConfigError::InstanceNameTooLong)?];
    labels.extend(type_name.labels);

    DomainName::from_labels(labels).ok_or(ConfigError::InstanceNameTooLong)
}

/// `mac` -> `mac.local.`
fn host_name(hostname: &str) -> Result<DomainName, ConfigError> {
    DomainName::from_dotted_string(&format!("{hostname}.local"))
        .ok_or_else(|| ConfigError::InvalidHostName(hostname.to_string()))
}

/// `key=value` strings in key order; a valueless key is just `key`.
fn txt_strings(txt: &BTreeMap<String, String>) -> Vec<Bytes> {
    txt.iter()
        .map(|(key, value)| {
            if value.is_empty() {
                Bytes::copy_from_slice(key.as_bytes())
            } else {
                Bytes::from(format!("{key}={value}"))
            }
        })
        .collect()
}
