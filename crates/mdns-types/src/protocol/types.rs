use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Maximum encoded length of a domain name.  The number of labels
/// plus sum of the lengths of the labels.
pub const DOMAINNAME_MAX_LEN: usize = 255;

/// Maximum length of a single label in a domain name.
pub const LABEL_MAX_LEN: usize = 63;

/// The mDNS UDP port, for both queries and responses.
pub const MDNS_PORT: u16 = 5353;

/// The IPv4 link-local multicast group mDNS operates on.
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Multicast DNS messages can be up to 9000 octets (RFC 6762 section
/// 17), much larger than the classic 512-octet DNS limit.
pub const MAX_PACKET_SIZE: usize = 9000;

/// TTL for records naming a specific host (A, SRV): RFC 6762 section 10.
pub const HOST_RECORD_TTL: u32 = 120;

/// TTL for long-lived service records (PTR, TXT): RFC 6762 section 10.
pub const SERVICE_RECORD_TTL: u32 = 4500;

/// Octet mask for the QR flag being set (response).
pub const HEADER_MASK_QR: u8 = 0b1000_0000;

/// Octet mask for the opcode field.
pub const HEADER_MASK_OPCODE: u8 = 0b0111_1000;

/// Offset for the opcode field.
pub const HEADER_OFFSET_OPCODE: usize = 3;

/// Octet mask for the AA flag being set (authoritative)
pub const HEADER_MASK_AA: u8 = 0b0000_0100;

/// Octet mask for the TC flag being set (truncated)
pub const HEADER_MASK_TC: u8 = 0b0000_0010;

/// Octet mask for the RD flag being set (desired)
pub const HEADER_MASK_RD: u8 = 0b0000_0001;

/// Octet mask for the RA flag being set (available)
pub const HEADER_MASK_RA: u8 = 0b1000_0000;

/// Octet mask for the rcode field.
pub const HEADER_MASK_RCODE: u8 = 0b0000_1111;

/// Offset for the rcode field.
pub const HEADER_OFFSET_RCODE: usize = 0;

/// Mask for the top bit of a 16-bit class field.  On a question this
/// is the QU bit (unicast response requested, RFC 6762 section 5.4);
/// on a resource record it is the cache-flush bit (RFC 6762 section
/// 10.2).
pub const CLASS_MASK_TOP_BIT: u16 = 0b1000_0000_0000_0000;

/// Mask for the low 15 bits of a class field, the class proper.
pub const CLASS_MASK_CLASS: u16 = 0b0111_1111_1111_1111;

/// Basic DNS message format, used for both queries and responses.
///
/// ```text
///     +---------------------+
///     |        Header       |
///     +---------------------+
///     |       Question      | the question for the name server
///     +---------------------+
///     |        Answer       | RRs answering the question
///     +---------------------+
///     |      Authority      | RRs pointing toward an authority
///     +---------------------+
///     |      Additional     | RRs holding additional information
///     +---------------------+
/// ```
///
/// See section 4.1 of RFC 1035.  In mDNS the ID is zero on multicast
/// and the authority section of a query carries the tentative records
/// of a probe (RFC 6762 section 8.1).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// A multicast query: ID zero, all flags clear.
    pub fn query(questions: Vec<Question>) -> Self {
        Self {
            header: Header::query(),
            questions,
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// A probe query: the questions ask for the names being claimed,
    /// the authority section asserts the tentative records (RFC 6762
    /// section 8.1).
    pub fn probe(questions: Vec<Question>, authority: Vec<ResourceRecord>) -> Self {
        Self {
            header: Header::query(),
            questions,
            answers: Vec::new(),
            authority,
            additional: Vec::new(),
        }
    }

    /// An unsolicited (or solicited) authoritative response: ID zero,
    /// QR and AA set (RFC 6762 section 18).
    pub fn response() -> Self {
        Self {
            header: Header::response(),
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }
}

/// Common header type for all messages.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.1 of RFC 1035.  The count fields are omitted from
/// this type, as they are only used during serialisation and
/// deserialisation and can be inferred from the other `Message`
/// fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Header {
    /// Query identifier.  Multicast DNS messages carry zero here on
    /// transmission; a legacy unicast response echoes the query's ID.
    pub id: u16,

    /// A one bit field that specifies whether this message is a query
    /// (0), or a response (1).
    pub is_response: bool,

    /// A four bit field that specifies kind of query in this message.
    /// mDNS messages with a non-standard opcode are silently ignored
    /// (RFC 6762 section 18.3).
    pub opcode: Opcode,

    /// Authoritative Answer - for mDNS responses this is always set,
    /// as a responder only ever speaks for records it owns.
    pub is_authoritative: bool,

    /// Truncation - in an mDNS query this signals that more
    /// known-answer records follow in another datagram.
    pub is_truncated: bool,

    /// Recursion Desired - meaningless for mDNS, preserved for wire
    /// fidelity.
    pub recursion_desired: bool,

    /// Recursion Available - meaningless for mDNS, preserved for wire
    /// fidelity.
    pub recursion_available: bool,

    /// Response code.  mDNS messages with a non-zero rcode are
    /// silently ignored (RFC 6762 section 18.11).
    pub rcode: Rcode,
}

impl Header {
    pub fn query() -> Self {
        Self {
            id: 0,
            is_response: false,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            rcode: Rcode::NoError,
        }
    }

    pub fn response() -> Self {
        Self {
            id: 0,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: true,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            rcode: Rcode::NoError,
        }
    }
}

/// The question section has a list of questions (usually 1 but
/// possibly more) being asked.  This is the structure for a single
/// question.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                     QNAME                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QTYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QCLASS                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.2 of RFC 1035.  The top bit of the QCLASS field is
/// the QU bit (RFC 6762 section 18.12), surfaced here as
/// `unicast_response`; the low 15 bits are the class proper.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Question {
    pub name: DomainName,

    pub qtype: QueryType,

    pub qclass: QueryClass,

    /// The QU bit: the querier would prefer a unicast response to
    /// this particular question.
    pub unicast_response: bool,
}

impl Question {
    /// A QM (multicast-response) question, class IN.
    pub fn new(name: DomainName, qtype: QueryType) -> Self {
        Self {
            name,
            qtype,
            qclass: QueryClass::Record(RecordClass::IN),
            unicast_response: false,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.name.to_dotted_string(),
            self.qclass,
            self.qtype,
            if self.unicast_response { " QU" } else { "" }
        )
    }
}

/// The answer, authority, and additional sections are all the same
/// format: a variable number of resource records.  This is the
/// structure for a single resource record.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                                               /
///     /                      NAME                     /
///     |                                               |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      TYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     CLASS                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      TTL                      |
///     |                                               |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                   RDLENGTH                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|--|
///     /                     RDATA                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.3 of RFC 1035.  The top bit of the CLASS field is
/// the cache-flush bit (RFC 6762 section 10.2), surfaced here as
/// `cache_flush`; the low 15 bits are the class proper.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct ResourceRecord {
    pub name: DomainName,

    /// A combination of the RTYPE and RDATA fields
    pub rtype_with_data: RecordTypeWithData,

    pub rclass: RecordClass,

    /// The cache-flush bit: receivers should discard any previously
    /// cached records for this (name, rtype) and keep only the
    /// records in this message.  Set on records which are unique to
    /// one responder, never on shared records.
    pub cache_flush: bool,

    /// a 32 bit unsigned integer that specifies the time interval (in
    /// seconds) that the resource record may be cached before it
    /// should be discarded.  A zero TTL is a goodbye: the record is
    /// gone.
    pub ttl: u32,
}

impl ResourceRecord {
    pub fn matches(&self, question: &Question) -> bool {
        self.name == question.name
            && self.rtype_with_data.matches(question.qtype)
            && self.rclass.matches(question.qclass)
    }

    /// The canonical RDATA octets: names uncompressed and lowercased.
    /// Two records with equal canonical RDATA carry the same data,
    /// and lexicographic comparison of canonical RDATA is the basis
    /// of probe tie-breaking (RFC 6762 section 8.2).
    pub fn rdata_canonical(&self) -> Bytes {
        self.rtype_with_data.rdata_canonical()
    }

    /// Ordering for simultaneous-probe conflict resolution: compare
    /// canonical RDATA lexicographically, break ties by the numeric
    /// rtype, then by the numeric rclass.  The greater record wins
    /// the name.
    pub fn tiebreak_cmp(&self, other: &Self) -> Ordering {
        self.rdata_canonical()
            .cmp(&other.rdata_canonical())
            .then_with(|| {
                u16::from(self.rtype_with_data.rtype())
                    .cmp(&u16::from(other.rtype_with_data.rtype()))
            })
            .then_with(|| u16::from(self.rclass).cmp(&u16::from(other.rclass)))
    }

    /// Whether this record carries the same data as another: same
    /// name (case-insensitively), same rtype, same canonical RDATA.
    pub fn same_data(&self, other: &Self) -> bool {
        self.name == other.name
            && self.rtype_with_data.rtype() == other.rtype_with_data.rtype()
            && self.rdata_canonical() == other.rdata_canonical()
    }
}

/// A record type with its associated, deserialised, data.  This is a
/// closed set: the five types DNS-SD traffics in, plus an opaque
/// variant so that unknown records pass through parsing untouched.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RecordTypeWithData {
    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                    ADDRESS                    |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `ADDRESS` is a 32 bit Internet address.
    A { address: Ipv4Addr },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                   PTRDNAME                    /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `PTRDNAME` is a domain name which points to some
    /// location in the domain name space.  DNS-SD uses PTR records to
    /// map a service type to its instances.
    PTR { ptrname: DomainName },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                   TXT-DATA                    /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// One or more length-prefixed character strings.  A TXT record
    /// with no strings is transmitted as a single empty string (RFC
    /// 6763 section 6.1); that form is normalised to an empty list
    /// here.
    TXT { strings: Vec<Bytes> },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                   PRIORITY                    |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                    WEIGHT                     |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     |                     PORT                      |
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                    TARGET                     /
    ///     /                                               /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// Where `TARGET` is the host providing the service.  The target
    /// name is never compressed on the wire (RFC 6762 section 18.14).
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    },

    /// ```text
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                  NEXT NAME                    /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    ///     /                 TYPE BITMAP                   /
    ///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    /// ```
    ///
    /// mDNS repurposes NSEC (RFC 4034 section 4) as a statement that
    /// no record types other than those in the bitmap exist for the
    /// owner name (RFC 6762 section 6.1).  `types` is kept sorted by
    /// numeric value and deduplicated, matching the bitmap order.
    NSEC {
        next_name: DomainName,
        types: Vec<RecordType>,
    },

    /// Any other record, carried opaquely.  Unknown types never cause
    /// a message to be rejected.
    Unknown { tag: RecordTypeUnknown, octets: Bytes },
}

impl RecordTypeWithData {
    pub fn matches(&self, qtype: QueryType) -> bool {
        self.rtype().matches(qtype)
    }

    pub fn rtype(&self) -> RecordType {
        match self {
            RecordTypeWithData::A { .. } => RecordType::A,
            RecordTypeWithData::PTR { .. } => RecordType::PTR,
            RecordTypeWithData::TXT { .. } => RecordType::TXT,
            RecordTypeWithData::SRV { .. } => RecordType::SRV,
            RecordTypeWithData::NSEC { .. } => RecordType::NSEC,
            RecordTypeWithData::Unknown { tag, .. } => RecordType::Unknown(*tag),
        }
    }

    /// See `ResourceRecord::rdata_canonical`.
    pub fn rdata_canonical(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            RecordTypeWithData::A { address } => buf.put_slice(&address.octets()),
            RecordTypeWithData::PTR { ptrname } => put_name_canonical(&mut buf, ptrname),
            RecordTypeWithData::TXT { strings } => {
                if strings.is_empty() {
                    buf.put_u8(0);
                }
                for s in strings {
                    #[allow(clippy::cast_possible_truncation)]
                    buf.put_u8(s.len() as u8);
                    buf.put_slice(s);
                }
            }
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buf.put_u16(*priority);
                buf.put_u16(*weight);
                buf.put_u16(*port);
                put_name_canonical(&mut buf, target);
            }
            RecordTypeWithData::NSEC { next_name, types } => {
                put_name_canonical(&mut buf, next_name);
                put_nsec_bitmap(&mut buf, types);
            }
            RecordTypeWithData::Unknown { octets, .. } => buf.put_slice(octets),
        }
        buf.freeze()
    }
}

fn put_name_canonical(buf: &mut BytesMut, name: &DomainName) {
    for label in &name.labels {
        buf.put_u8(label.len());
        for octet in label.octets() {
            buf.put_u8(octet.to_ascii_lowercase());
        }
    }
}

/// The NSEC type bitmap: `(window, length, bits)` groups with a bit
/// per present type, most significant bit first (RFC 4034 section
/// 4.1.2).  mDNS assertions only ever need window zero, but foreign
/// records decode and re-encode faithfully.
#[allow(clippy::cast_possible_truncation)]
pub fn put_nsec_bitmap(buf: &mut BytesMut, types: &[RecordType]) {
    let mut values: Vec<u16> = types.iter().map(|t| u16::from(*t)).collect();
    values.sort_unstable();
    values.dedup();

    let mut i = 0;
    while i < values.len() {
        let window = (values[i] >> 8) as u8;
        let mut bits = [0u8; 32];
        let mut last_octet = 0;

        while i < values.len() && (values[i] >> 8) as u8 == window {
            let low = (values[i] & 0xFF) as u8;
            bits[usize::from(low) / 8] |= 0x80 >> (low % 8);
            last_octet = usize::from(low) / 8;
            i += 1;
        }

        buf.put_u8(window);
        buf.put_u8((last_octet + 1) as u8);
        buf.put_slice(&bits[..=last_octet]);
    }
}

/// What sort of query this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Opcode {
    Standard,
    Inverse,
    Status,
    Reserved(OpcodeReserved),
}

/// A struct with a private constructor, to ensure invalid `Opcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpcodeReserved(u8);

impl From<u8> for Opcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Opcode::Standard,
            1 => Opcode::Inverse,
            2 => Opcode::Status,
            other => Opcode::Reserved(OpcodeReserved(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Standard => 0,
            Opcode::Inverse => 1,
            Opcode::Status => 2,
            Opcode::Reserved(OpcodeReserved(octet)) => octet,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Opcode {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u8>()?))
    }
}

/// What sort of response this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rcode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Reserved(RcodeReserved),
}

/// A struct with a private constructor, to ensure invalid `Rcode`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RcodeReserved(u8);

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "no-error"),
            Rcode::FormatError => write!(f, "format-error"),
            Rcode::ServerFailure => write!(f, "server-failure"),
            Rcode::NameError => write!(f, "name-error"),
            Rcode::NotImplemented => write!(f, "not-implemented"),
            Rcode::Refused => write!(f, "refused"),
            Rcode::Reserved(_) => write!(f, "reserved"),
        }
    }
}

impl From<u8> for Rcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Rcode::NoError,
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            other => Rcode::Reserved(RcodeReserved(other)),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::Reserved(RcodeReserved(octet)) => octet,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Rcode {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u8>()?))
    }
}

/// A domain name is a sequence of labels, where each label is a
/// length octet followed by that number of octets.
///
/// A label must be 63 octets or shorter.  A name must be 255 octets
/// or shorter in total, including both length and label octets.
///
/// Names compare case-insensitively but preserve the case they were
/// built with, so a record registered as `My Printer._ipp._tcp.local`
/// goes out on the wire spelled that way.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct DomainName {
    pub labels: Vec<Label>,
    // INVARIANT: len == len(labels) + sum(map(len, labels))
    pub len: usize,
}

impl DomainName {
    pub fn root_domain() -> Self {
        DomainName {
            labels: vec![Label::new()],
            len: 1,
        }
    }

    pub fn is_root(&self) -> bool {
        self.len == 1 && self.labels[0].is_empty()
    }

    pub fn is_subdomain_of(&self, other: &DomainName) -> bool {
        self.labels.len() >= other.labels.len()
            && self.labels[self.labels.len() - other.labels.len()..] == other.labels[..]
    }

    /// A copy with every label lowercased: the canonical form used
    /// for indexing and tie-breaking.
    pub fn to_lowercase(&self) -> Self {
        Self {
            labels: self.labels.iter().map(Label::to_lowercase).collect(),
            len: self.len,
        }
    }

    pub fn to_dotted_string(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }

        let mut out = String::with_capacity(self.len);
        let mut first = true;
        for label in &self.labels {
            if first {
                first = false;
            } else {
                out.push('.');
            }
            for octet in label.octets() {
                out.push(*octet as char);
            }
        }

        out
    }

    /// Parse a dotted name.  A missing trailing dot is tolerated:
    /// mDNS names are always rooted, so `printer.local` and
    /// `printer.local.` are the same name.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s == "." {
            return Some(Self::root_domain());
        }

        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return None;
        }

        let chunks = s.split('.').collect::<Vec<_>>();
        let mut labels = Vec::with_capacity(chunks.len() + 1);

        for label_chars in &chunks {
            if label_chars.is_empty() {
                return None;
            }

            match label_chars.as_bytes().try_into() {
                Ok(label) => labels.push(label),
                Err(_) => return None,
            }
        }

        labels.push(Label::new());
        Self::from_labels(labels)
    }

    pub fn from_labels(labels: Vec<Label>) -> Option<Self> {
        if labels.is_empty() {
            return None;
        }

        let mut len = labels.len();
        let mut blank_label = false;

        for label in &labels {
            if blank_label {
                return None;
            }

            blank_label |= label.is_empty();
            len += label.len() as usize;
        }

        if blank_label && len <= DOMAINNAME_MAX_LEN {
            Some(Self { labels, len })
        } else {
            None
        }
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainName")
            .field("to_dotted_string()", &self.to_dotted_string())
            .finish()
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.to_dotted_string())
    }
}

impl FromStr for DomainName {
    type Err = DomainNameFromStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(domain) = DomainName::from_dotted_string(s) {
            Ok(domain)
        } else {
            Err(DomainNameFromStr::NoParse)
        }
    }
}

/// Errors that can arise when converting a `&str` into a `DomainName`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DomainNameFromStr {
    NoParse,
}

impl fmt::Display for DomainNameFromStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not parse string to domain name")
    }
}

impl std::error::Error for DomainNameFromStr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for DomainName {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_labels = u.int_in_range::<usize>(1..=4)?;
        let mut labels = Vec::new();
        for _ in 0..num_labels {
            labels.push(u.arbitrary()?);
        }
        labels.push(Label::new());
        Ok(DomainName::from_labels(labels).unwrap())
    }
}

/// A label is just a sequence of octets, which are compared as
/// case-insensitive ASCII.  A label can be no longer than 63 octets.
#[derive(Clone)]
pub struct Label {
    /// Private to this module so constructing an invalid `Label` is
    /// impossible.
    octets: Bytes,
}

impl Label {
    /// Create a new, empty, label.
    pub fn new() -> Self {
        Self {
            octets: Bytes::new(),
        }
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn len(&self) -> u8 {
        // safe as the `TryFrom` ensures a label is <= 63 bytes
        self.octets.len().try_into().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.octets.is_empty()
    }

    pub fn octets(&self) -> &Bytes {
        &self.octets
    }

    pub fn to_lowercase(&self) -> Self {
        Self {
            octets: Bytes::copy_from_slice(&self.octets.to_ascii_lowercase()),
        }
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Label").field(&self.octets).finish()
    }
}

impl Default for Label {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.octets.eq_ignore_ascii_case(&other.octets)
    }
}

impl Eq for Label {}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        self.octets
            .iter()
            .map(u8::to_ascii_lowercase)
            .cmp(other.octets.iter().map(u8::to_ascii_lowercase))
    }
}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for octet in &self.octets {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

impl TryFrom<&[u8]> for Label {
    type Error = LabelTryFromOctetsError;

    fn try_from(octets: &[u8]) -> Result<Self, Self::Error> {
        if octets.len() > LABEL_MAX_LEN {
            return Err(LabelTryFromOctetsError::TooLong);
        }

        Ok(Self {
            octets: Bytes::copy_from_slice(octets),
        })
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Label {
    // only generates non-empty labels
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Label> {
        let label_len = u.int_in_range::<u8>(1..=20)?;
        let mut octets = BytesMut::with_capacity(label_len.into());
        let bs = u.bytes(label_len.into())?;
        for b in bs {
            let ascii_byte = if b.is_ascii() { *b } else { *b % 128 };
            octets.put_u8(
                if ascii_byte == b'.'
                    || ascii_byte == b'*'
                    || ascii_byte == b'@'
                    || ascii_byte == b'#'
                    || (ascii_byte as char).is_whitespace()
                {
                    b'x'
                } else {
                    ascii_byte
                },
            );
        }
        Ok(Self {
            octets: octets.freeze(),
        })
    }
}

/// Errors that can arise when converting a `[u8]` into a `Label`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LabelTryFromOctetsError {
    TooLong,
}

/// Query types are a superset of record types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueryType {
    Record(RecordType),
    Wildcard,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryType::Record(rtype) => rtype.fmt(f),
            QueryType::Wildcard => write!(f, "ANY"),
        }
    }
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            255 => QueryType::Wildcard,
            _ => QueryType::Record(RecordType::from(value)),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> Self {
        match value {
            QueryType::Wildcard => 255,
            QueryType::Record(rtype) => rtype.into(),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for QueryType {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Query classes are a superset of record classes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QueryClass {
    Record(RecordClass),
    Wildcard,
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryClass::Record(rclass) => rclass.fmt(f),
            QueryClass::Wildcard => write!(f, "ANY"),
        }
    }
}

impl From<u16> for QueryClass {
    fn from(value: u16) -> Self {
        match value & CLASS_MASK_CLASS {
            255 => QueryClass::Wildcard,
            other => QueryClass::Record(RecordClass::from(other)),
        }
    }
}

impl From<QueryClass> for u16 {
    fn from(value: QueryClass) -> Self {
        match value {
            QueryClass::Wildcard => 255,
            QueryClass::Record(rclass) => rclass.into(),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for QueryClass {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Record types are used by resource records and by queries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordType {
    A,
    PTR,
    TXT,
    SRV,
    NSEC,
    Unknown(RecordTypeUnknown),
}

/// A struct with a private constructor, to ensure invalid `RecordType`s
/// cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordTypeUnknown(u16);

impl RecordType {
    pub fn is_unknown(&self) -> bool {
        matches!(self, RecordType::Unknown(_))
    }

    pub fn matches(&self, qtype: QueryType) -> bool {
        match qtype {
            QueryType::Wildcard => true,
            QueryType::Record(rtype) => rtype == *self,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::NSEC => write!(f, "NSEC"),
            RecordType::Unknown(RecordTypeUnknown(n)) => write!(f, "TYPE{n}"),
        }
    }
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            12 => RecordType::PTR,
            16 => RecordType::TXT,
            33 => RecordType::SRV,
            47 => RecordType::NSEC,
            _ => RecordType::Unknown(RecordTypeUnknown(value)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::PTR => 12,
            RecordType::TXT => 16,
            RecordType::SRV => 33,
            RecordType::NSEC => 47,
            RecordType::Unknown(RecordTypeUnknown(value)) => value,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordType {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Record classes are used by resource records and by queries.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordClass {
    IN,
    Unknown(RecordClassUnknown),
}

/// A struct with a private constructor, to ensure invalid
/// `RecordClass`es cannot be created.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordClassUnknown(u16);

impl RecordClass {
    pub fn matches(&self, qclass: QueryClass) -> bool {
        match qclass {
            QueryClass::Wildcard => true,
            QueryClass::Record(rclass) => rclass == *self,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
            RecordClass::Unknown(RecordClassUnknown(n)) => write!(f, "CLASS{n}"),
        }
    }
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value & CLASS_MASK_CLASS {
            1 => RecordClass::IN,
            other => RecordClass::Unknown(RecordClassUnknown(other)),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
            RecordClass::Unknown(RecordClassUnknown(value)) => value,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordClass {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordTypeWithData {
    // this is pretty verbose but it keeps the generated values inside
    // what the wire format can round-trip
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let len = u.int_in_range(0..=128)?;
        let octets = Bytes::copy_from_slice(u.bytes(len)?);

        let rtype_with_data = match u.arbitrary::<RecordType>()? {
            RecordType::A => RecordTypeWithData::A {
                address: u.arbitrary()?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrname: u.arbitrary()?,
            },
            RecordType::TXT => {
                let num_strings = u.int_in_range(0..=3)?;
                let mut strings = Vec::with_capacity(num_strings);
                for _ in 0..num_strings {
                    let string_len = u.int_in_range(1..=16)?;
                    strings.push(Bytes::copy_from_slice(u.bytes(string_len)?));
                }
                RecordTypeWithData::TXT { strings }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: u.arbitrary()?,
                weight: u.arbitrary()?,
                port: u.arbitrary()?,
                target: u.arbitrary()?,
            },
            RecordType::NSEC => {
                // a sorted subset of the known types, matching what
                // decoding a window-zero bitmap produces
                let mut types = Vec::new();
                for rtype in [
                    RecordType::A,
                    RecordType::PTR,
                    RecordType::TXT,
                    RecordType::SRV,
                    RecordType::NSEC,
                ] {
                    if u.arbitrary::<bool>()? {
                        types.push(rtype);
                    }
                }
                if types.is_empty() {
                    types.push(RecordType::A);
                }
                RecordTypeWithData::NSEC {
                    next_name: u.arbitrary()?,
                    types,
                }
            }
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown { tag, octets },
        };
        Ok(rtype_with_data)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn u8_opcode_roundtrip() {
        for i in 0..15 {
            assert_eq!(u8::from(Opcode::from(i)), i);
        }
    }

    #[test]
    fn u8_rcode_roundtrip() {
        for i in 0..15 {
            assert_eq!(u8::from(Rcode::from(i)), i);
        }
    }

    #[test]
    fn u16_querytype_roundtrip() {
        for i in 0..300 {
            assert_eq!(u16::from(QueryType::from(i)), i);
        }
    }

    #[test]
    fn u16_recordtype_roundtrip() {
        for i in 0..300 {
            assert_eq!(u16::from(RecordType::from(i)), i);
        }
    }

    #[test]
    fn u16_recordclass_strips_top_bit() {
        assert_eq!(RecordClass::from(0x8001), RecordClass::IN);
        assert_eq!(u16::from(RecordClass::from(1)), 1);
    }

    #[test]
    fn known_rtype_values() {
        assert_eq!(u16::from(RecordType::A), 1);
        assert_eq!(u16::from(RecordType::PTR), 12);
        assert_eq!(u16::from(RecordType::TXT), 16);
        assert_eq!(u16::from(RecordType::SRV), 33);
        assert_eq!(u16::from(RecordType::NSEC), 47);
    }

    #[test]
    fn domainname_root_conversions() {
        assert_eq!(
            Some(DomainName::root_domain()),
            DomainName::from_dotted_string(".")
        );

        assert_eq!(
            Some(DomainName::root_domain()),
            DomainName::from_labels(vec![Label::new()])
        );

        assert_eq!(".", DomainName::root_domain().to_dotted_string());
    }

    #[test]
    fn from_dotted_string_tolerates_missing_root_dot() {
        assert_eq!(domain("printer.local."), domain("printer.local"));
    }

    #[test]
    fn domainname_equality_is_case_insensitive() {
        assert_eq!(domain("Printer._ipp._tcp.local."), domain("printer._IPP._tcp.LOCAL."));
    }

    #[test]
    fn domainname_preserves_case_for_output() {
        assert_eq!(
            "My Printer._ipp._tcp.local.",
            DomainName::from_dotted_string("My Printer._ipp._tcp.local")
                .unwrap()
                .to_dotted_string()
        );
    }

    #[test]
    fn is_subdomain_of_is_case_insensitive() {
        assert!(domain("Printer._ipp._tcp.local.").is_subdomain_of(&domain("_IPP._tcp.local.")));
        assert!(!domain("printer._ipp._tcp.local.").is_subdomain_of(&domain("_http._tcp.local.")));
    }

    #[test]
    fn txt_empty_canonical_form_is_single_zero_octet() {
        let rdata = RecordTypeWithData::TXT { strings: Vec::new() }.rdata_canonical();
        assert_eq!(&[0][..], &rdata[..]);
    }

    #[test]
    fn nsec_bitmap_window_zero() {
        let mut buf = BytesMut::new();
        put_nsec_bitmap(&mut buf, &[RecordType::A, RecordType::SRV, RecordType::TXT]);
        // A = 1, TXT = 16, SRV = 33: five octets of bitmap
        assert_eq!(
            vec![
                0, 5, // window 0, 5 octets
                0b0100_0000, // A
                0b0000_0000,
                0b1000_0000, // TXT
                0b0000_0000,
                0b0100_0000, // SRV
            ],
            buf.to_vec(),
        );
    }

    #[test]
    fn tiebreak_prefers_greater_rdata() {
        let lesser = srv_record("printer._ipp._tcp.local.", 631, "a.local.");
        let greater = srv_record("printer._ipp._tcp.local.", 631, "b.local.");

        assert_eq!(Ordering::Less, lesser.tiebreak_cmp(&greater));
        assert_eq!(Ordering::Greater, greater.tiebreak_cmp(&lesser));
        assert_eq!(Ordering::Equal, lesser.tiebreak_cmp(&lesser));
    }

    #[test]
    fn tiebreak_breaks_rdata_ties_by_rtype() {
        let name = domain("printer._ipp._tcp.local.");
        let a = ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::Unknown {
                tag: match RecordType::from(200) {
                    RecordType::Unknown(tag) => tag,
                    _ => unreachable!(),
                },
                octets: Bytes::from_static(b"xyz"),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: 120,
        };
        let b = ResourceRecord {
            name,
            rtype_with_data: RecordTypeWithData::Unknown {
                tag: match RecordType::from(201) {
                    RecordType::Unknown(tag) => tag,
                    _ => unreachable!(),
                },
                octets: Bytes::from_static(b"xyz"),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: 120,
        };

        assert_eq!(Ordering::Less, a.tiebreak_cmp(&b));
    }

    #[test]
    fn same_data_ignores_case_and_ttl() {
        let mut a = srv_record("Printer._ipp._tcp.local.", 631, "Mac.local.");
        let b = srv_record("printer._ipp._tcp.local.", 631, "mac.local.");
        a.ttl = 4500;

        assert!(a.same_data(&b));
    }
}

#[cfg(any(feature = "test-util", test))]
#[allow(clippy::missing_panics_doc)]
pub mod test_util {
    use super::*;

    use arbitrary::{Arbitrary, Unstructured};
    use rand::Rng;

    pub fn arbitrary_resourcerecord() -> ResourceRecord {
        let mut rng = rand::thread_rng();
        for size in [128, 256, 512, 1024, 2048, 4096] {
            let mut buf = BytesMut::with_capacity(size);
            for _ in 0..size {
                buf.put_u8(rng.gen());
            }

            if let Ok(rr) = ResourceRecord::arbitrary(&mut Unstructured::new(&buf.freeze())) {
                return rr;
            }
        }

        panic!("could not generate arbitrary value!");
    }

    pub fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    pub fn a_record(name: &str, address: Ipv4Addr) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::A { address },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: HOST_RECORD_TTL,
        }
    }

    pub fn ptr_record(name: &str, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::PTR {
                ptrname: domain(target),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: SERVICE_RECORD_TTL,
        }
    }

    pub fn srv_record(name: &str, port: u16, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::SRV {
                priority: 0,
                weight: 0,
                port,
                target: domain(target),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: HOST_RECORD_TTL,
        }
    }

    pub fn txt_record(name: &str, strings: &[&[u8]]) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::TXT {
                strings: strings.iter().map(|s| Bytes::copy_from_slice(s)).collect(),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: SERVICE_RECORD_TTL,
        }
    }

    pub fn nsec_record(name: &str, types: &[RecordType]) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::NSEC {
                next_name: domain(name),
                types: types.to_vec(),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: HOST_RECORD_TTL,
        }
    }
}
