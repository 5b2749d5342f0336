//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.
//!
//! Parsing is total: any sequence of octets either produces a
//! `Message` or an `Error`, never a panic.  Datagrams arrive from
//! anyone on the link, so nothing here trusts a length field.

use bytes::Bytes;
use std::net::Ipv4Addr;

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        let mut buffer = ConsumableBuffer::new(octets);
        let message = Self::deserialise(&mut buffer)?;

        // trailing octets mean a malformed message, unless the sender
        // flagged truncation (more known-answer records may follow in
        // another datagram)
        if buffer.remaining() > 0 && !message.header.is_truncated {
            return Err(Error::TrailingOctets);
        }

        Ok(message)
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(usize::from(wire_header.qdcount).min(64));
        let mut answers = Vec::with_capacity(usize::from(wire_header.ancount).min(64));
        let mut authority = Vec::with_capacity(usize::from(wire_header.nscount).min(64));
        let mut additional = Vec::with_capacity(usize::from(wire_header.arcount).min(64));

        let mut message = Self {
            header: wire_header.header,
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        // a message with TC set may legitimately stop partway through
        // a section: keep what parsed cleanly and surface the flag
        let truncated = wire_header.header.is_truncated;
        macro_rules! try_or_truncate {
            ($e:expr) => {
                match $e {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        if truncated {
                            message.questions = questions;
                            message.answers = answers;
                            message.authority = authority;
                            message.additional = additional;
                            return Ok(message);
                        }
                        return Err(err);
                    }
                }
            };
        }

        for _ in 0..wire_header.qdcount {
            let question = try_or_truncate!(Question::deserialise(buffer));
            questions.push(question);
        }
        for _ in 0..wire_header.ancount {
            let rr = try_or_truncate!(ResourceRecord::deserialise(buffer));
            answers.push(rr);
        }
        for _ in 0..wire_header.nscount {
            let rr = try_or_truncate!(ResourceRecord::deserialise(buffer));
            authority.push(rr);
        }
        for _ in 0..wire_header.arcount {
            let rr = try_or_truncate!(ResourceRecord::deserialise(buffer));
            additional.push(rr);
        }

        message.questions = questions;
        message.answers = answers;
        message.authority = authority;
        message.additional = additional;
        Ok(message)
    }
}

/// The header as it appears on the wire, with the section counts.
pub struct WireHeader {
    pub header: Header,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort)?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort)?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let qtype = buffer
            .next_u16()
            .map(QueryType::from)
            .ok_or(Error::QuestionTooShort)?;
        let qclass_raw = buffer.next_u16().ok_or(Error::QuestionTooShort)?;

        Ok(Self {
            name,
            qtype,
            qclass: QueryClass::from(qclass_raw),
            unicast_response: qclass_raw & CLASS_MASK_TOP_BIT != 0,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let rtype = buffer
            .next_u16()
            .map(RecordType::from)
            .ok_or(Error::ResourceRecordTooShort)?;
        let rclass_raw = buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?;

        let rdata_start = buffer.position();
        let rdata_end = rdata_start + usize::from(rdlength);

        // for records which include domain names, deserialise them to
        // expand pointers.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(
                    buffer.next_u32().ok_or(Error::ResourceRecordTooShort)?,
                ),
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrname: DomainName::deserialise(buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                strings: deserialise_txt_strings(buffer, rdata_end)?,
            },
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?,
                weight: buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?,
                port: buffer.next_u16().ok_or(Error::ResourceRecordTooShort)?,
                target: DomainName::deserialise(buffer)?,
            },
            RecordType::NSEC => RecordTypeWithData::NSEC {
                next_name: DomainName::deserialise(buffer)?,
                types: deserialise_nsec_bitmap(buffer, rdata_end)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: buffer
                    .take(usize::from(rdlength))
                    .map(Bytes::copy_from_slice)
                    .ok_or(Error::ResourceRecordTooShort)?,
            },
        };

        if buffer.position() == rdata_end {
            Ok(Self {
                name,
                rtype_with_data,
                rclass: RecordClass::from(rclass_raw),
                cache_flush: rclass_raw & CLASS_MASK_TOP_BIT != 0,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid)
        }
    }
}

/// Length-prefixed character strings, bounded by the RDATA.  Empty
/// strings are dropped: the "single empty string" encoding of an
/// empty TXT record (RFC 6763 section 6.1) normalises to no strings.
fn deserialise_txt_strings(
    buffer: &mut ConsumableBuffer,
    rdata_end: usize,
) -> Result<Vec<Bytes>, Error> {
    let mut strings = Vec::new();

    while buffer.position() < rdata_end {
        let len = buffer.next_u8().ok_or(Error::ResourceRecordTooShort)?;
        if buffer.position() + usize::from(len) > rdata_end {
            return Err(Error::ResourceRecordInvalid);
        }
        let octets = buffer
            .take(usize::from(len))
            .ok_or(Error::ResourceRecordTooShort)?;
        if len > 0 {
            strings.push(Bytes::copy_from_slice(octets));
        }
    }

    Ok(strings)
}

/// The NSEC type bitmap: a sequence of `(window, length, bits)`
/// groups, bounded by the RDATA (RFC 4034 section 4.1.2).
fn deserialise_nsec_bitmap(
    buffer: &mut ConsumableBuffer,
    rdata_end: usize,
) -> Result<Vec<RecordType>, Error> {
    let mut types = Vec::new();

    while buffer.position() < rdata_end {
        let window = buffer.next_u8().ok_or(Error::ResourceRecordTooShort)?;
        let len = buffer.next_u8().ok_or(Error::ResourceRecordTooShort)?;
        if len == 0 || len > 32 || buffer.position() + usize::from(len) > rdata_end {
            return Err(Error::ResourceRecordInvalid);
        }
        let bits = buffer
            .take(usize::from(len))
            .ok_or(Error::ResourceRecordTooShort)?;

        for (i, octet) in bits.iter().enumerate() {
            for bit in 0..8 {
                if octet & (0x80 >> bit) != 0 {
                    #[allow(clippy::cast_possible_truncation)]
                    let value = (u16::from(window) << 8) | ((i * 8 + bit) as u16);
                    types.push(RecordType::from(value));
                }
            }
        }
    }

    // windows can arrive in any order; normalise to the order
    // `put_nsec_bitmap` emits so re-encoding is faithful
    types.sort_unstable_by_key(|t| u16::from(*t));
    types.dedup();

    Ok(types)
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    #[allow(clippy::missing_panics_doc)]
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut len = 0;
        let mut labels = Vec::<Label>::with_capacity(5);
        let start = buffer.position();

        'outer: loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort)?;

            if usize::from(size) <= LABEL_MAX_LEN {
                len += 1;

                if size == 0 {
                    labels.push(Label::new());
                    break 'outer;
                }

                if let Some(os) = buffer.take(size as usize) {
                    // safe because of the bounds check above
                    let label = Label::try_from(os).unwrap();
                    len += usize::from(label.len());
                    labels.push(label);
                } else {
                    return Err(Error::DomainTooShort);
                }

                if len > DOMAINNAME_MAX_LEN {
                    break 'outer;
                }
            } else if size >= 192 {
                // a pointer must point to an earlier offset (not
                // merely a different one: an earlier one: RFC 1035
                // section 4.1.4), so chains of pointers strictly
                // decrease and cannot loop
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort)?;
                let ptr = u16::from_be_bytes([hi, lo]).into();

                if ptr >= start {
                    return Err(Error::DomainPointerInvalid);
                }

                let mut other = DomainName::deserialise(&mut buffer.at_offset(ptr))?;
                len += other.len;
                labels.append(&mut other.labels);
                break 'outer;
            } else {
                return Err(Error::DomainLabelInvalid);
            }
        }

        if len <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { labels, len })
        } else {
            Err(Error::DomainTooLong)
        }
    }
}

/// Errors encountered when parsing a datagram.  These are all folded
/// into a single malformed-message outcome by the engine: the
/// offending datagram is counted and dropped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The header is missing one or more required fields.
    HeaderTooShort,

    /// A question ends with an incomplete field.
    QuestionTooShort,

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort,

    /// A resource record is the wrong format.
    ResourceRecordInvalid,

    /// A domain is incomplete.
    DomainTooShort,

    /// A domain is over 255 octets in size.
    DomainTooLong,

    /// A domain pointer points to or after the current record.
    DomainPointerInvalid,

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid,

    /// Octets remain after the final section of a message which does
    /// not have the TC flag set.
    TrailingOctets,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::HeaderTooShort => write!(f, "header too short"),
            Error::QuestionTooShort => write!(f, "question too short"),
            Error::ResourceRecordTooShort => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid => write!(f, "resource record invalid"),
            Error::DomainTooShort => write!(f, "domain name too short"),
            Error::DomainTooLong => write!(f, "domain name too long"),
            Error::DomainPointerInvalid => write!(f, "domain name pointer invalid"),
            Error::DomainLabelInvalid => write!(f, "domain name label invalid"),
            Error::TrailingOctets => write!(f, "trailing octets after message"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.octets.len().saturating_sub(self.position)
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    fn deserialise_header_too_short() {
        assert_eq!(Err(Error::HeaderTooShort), Message::from_octets(&[0, 0, 0]));
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_question_with_qu_bit() {
        let message = Message::from_octets(&[
            0, 0, // id
            0, 0, // flags
            0, 1, // qdcount
            0, 0, 0, 0, 0, 0, // other counts
            7, 112, 114, 105, 110, 116, 101, 114, // "printer"
            5, 108, 111, 99, 97, 108, 0, // "local"
            0, 1, // qtype A
            0b1000_0000, 1, // qclass IN with the QU bit
        ])
        .unwrap();

        let question = &message.questions[0];
        assert_eq!(domain("printer.local."), question.name);
        assert_eq!(QueryType::Record(RecordType::A), question.qtype);
        assert_eq!(QueryClass::Record(RecordClass::IN), question.qclass);
        assert!(question.unicast_response);
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_record_with_cache_flush_bit() {
        let message = Message::from_octets(&[
            0, 0, // id
            0b1000_0100, 0, // response, authoritative
            0, 0, // qdcount
            0, 1, // ancount
            0, 0, 0, 0, // other counts
            3, 109, 97, 99, // "mac"
            5, 108, 111, 99, 97, 108, 0, // "local"
            0, 1, // type A
            0b1000_0000, 1, // class IN with cache-flush
            0, 0, 0, 120, // ttl
            0, 4, // rdlength
            192, 168, 1, 10, // address
        ])
        .unwrap();

        let rr = &message.answers[0];
        assert!(rr.cache_flush);
        assert_eq!(RecordClass::IN, rr.rclass);
        assert_eq!(
            RecordTypeWithData::A { address: std::net::Ipv4Addr::new(192, 168, 1, 10) },
            rr.rtype_with_data
        );
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_rejects_forward_pointer() {
        // the name is a pointer to itself
        let result = Message::from_octets(&[
            0, 0,
            0, 0,
            0, 1,
            0, 0, 0, 0, 0, 0,
            0b1100_0000, 12, // pointer to offset 12: this octet
            0, 1,
            0, 1,
        ]);

        assert_eq!(Err(Error::DomainPointerInvalid), result);
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_rejects_pointer_loop() {
        // two names pointing at each other
        let result = Message::from_octets(&[
            0, 0,
            0, 0,
            0, 2,
            0, 0, 0, 0, 0, 0,
            0b1100_0000, 16, // question 1 name: pointer to question 2 name
            0, 1,
            0, 1,
            0b1100_0000, 12, // question 2 name: pointer back
            0, 1,
            0, 1,
        ]);

        // the forward pointer is rejected before the loop can form
        assert_eq!(Err(Error::DomainPointerInvalid), result);
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_rejects_overlong_label() {
        let mut octets = vec![
            0, 0,
            0, 0,
            0, 1,
            0, 0, 0, 0, 0, 0,
            64, // label length over 63, and not a pointer tag
        ];
        octets.extend(std::iter::repeat(b'x').take(64));
        octets.extend([0, 0, 1, 0, 1]);

        assert_eq!(Err(Error::DomainLabelInvalid), Message::from_octets(&octets));
    }

    #[test]
    fn deserialise_rejects_trailing_octets() {
        let mut octets = Message::query(vec![Question::new(
            domain("printer.local."),
            QueryType::Record(RecordType::A),
        )])
        .to_octets()
        .unwrap()
        .to_vec();
        octets.push(0);

        assert_eq!(Err(Error::TrailingOctets), Message::from_octets(&octets));
    }

    #[test]
    fn deserialise_accepts_truncated_message_with_tc() {
        let mut message = Message::query(vec![Question::new(
            domain("_ipp._tcp.local."),
            QueryType::Record(RecordType::PTR),
        )]);
        message.answers.push(ptr_record(
            "_ipp._tcp.local.",
            "printer._ipp._tcp.local.",
        ));
        message.header.is_truncated = true;

        let mut octets = message.to_octets().unwrap().to_vec();
        // chop the answer record off mid-way
        octets.truncate(octets.len() - 5);

        let parsed = Message::from_octets(&octets).unwrap();
        assert!(parsed.header.is_truncated);
        assert_eq!(message.questions, parsed.questions);
        assert_eq!(Vec::<ResourceRecord>::new(), parsed.answers);
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_txt_single_empty_string_is_no_strings() {
        let message = Message::from_octets(&[
            0, 0,
            0b1000_0100, 0,
            0, 0,
            0, 1,
            0, 0, 0, 0,
            3, 115, 118, 99, // "svc"
            5, 108, 111, 99, 97, 108, 0, // "local"
            0, 16, // type TXT
            0, 1, // class IN
            0, 0, 0x11, 0x94, // ttl 4500
            0, 1, // rdlength
            0, // one empty string
        ])
        .unwrap();

        assert_eq!(
            RecordTypeWithData::TXT { strings: Vec::new() },
            message.answers[0].rtype_with_data
        );
    }

    #[test]
    fn deserialise_txt_reencodes_identically() {
        let rr = txt_record("svc.local.", &[]);
        let mut response = Message::response();
        response.answers.push(rr);

        let octets = response.to_octets().unwrap();
        let parsed = Message::from_octets(&octets).unwrap();
        let reencoded = parsed.to_octets().unwrap();

        assert_eq!(octets, reencoded);
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_unknown_rtype_is_opaque_not_fatal() {
        let message = Message::from_octets(&[
            0, 0,
            0b1000_0100, 0,
            0, 0,
            0, 1,
            0, 0, 0, 0,
            3, 115, 118, 99, // "svc"
            5, 108, 111, 99, 97, 108, 0, // "local"
            0, 99, // some unknown type
            0, 1, // class IN
            0, 0, 0, 120,
            0, 3, // rdlength
            1, 2, 3,
        ])
        .unwrap();

        let rr = &message.answers[0];
        assert_eq!(RecordType::from(99), rr.rtype_with_data.rtype());
        match &rr.rtype_with_data {
            RecordTypeWithData::Unknown { octets, .. } => {
                assert_eq!(&[1, 2, 3][..], &octets[..]);
            }
            other => panic!("expected opaque rdata, got {other:?}"),
        }
    }

    #[test]
    #[rustfmt::skip]
    fn deserialise_nsec_bitmap() {
        let message = Message::from_octets(&[
            0, 0,
            0b1000_0100, 0,
            0, 0,
            0, 1,
            0, 0, 0, 0,
            3, 109, 97, 99, // "mac"
            5, 108, 111, 99, 97, 108, 0, // "local"
            0, 47, // type NSEC
            0b1000_0000, 1, // class IN, cache-flush
            0, 0, 0, 120,
            0, 16, // rdlength
            3, 109, 97, 99, 5, 108, 111, 99, 97, 108, 0, // next name, uncompressed
            0, 3, // window 0, 3 octets
            0b0100_0000, 0, 0, // just A
        ])
        .unwrap();

        assert_eq!(
            RecordTypeWithData::NSEC {
                next_name: domain("mac.local."),
                types: vec![RecordType::A],
            },
            message.answers[0].rtype_with_data
        );
    }

    #[test]
    fn deserialise_never_panics_on_noise() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let len = rng.gen_range(0..MAX_PACKET_SIZE);
            let mut octets = vec![0u8; len];
            rng.fill(&mut octets[..]);

            // must return, with either result
            let _ = Message::from_octets(&octets);
        }
    }

    #[test]
    fn deserialise_rdlength_mismatch_rejected() {
        // an A record claiming 6 octets of rdata but encoding 4
        #[rustfmt::skip]
        let octets = [
            0, 0,
            0b1000_0100, 0,
            0, 0,
            0, 1,
            0, 0, 0, 0,
            3, 109, 97, 99, 5, 108, 111, 99, 97, 108, 0,
            0, 1,
            0, 1,
            0, 0, 0, 120,
            0, 6, // wrong rdlength
            192, 168, 1, 10,
            0, 0,
        ];

        assert_eq!(
            Err(Error::ResourceRecordInvalid),
            Message::from_octets(&octets)
        );
    }
}
