//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

/// Offset above which a name can no longer be the target of a
/// compression pointer (pointers have 14 usable bits).
const MAX_POINTER_TARGET: usize = 0x3FFF;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        let mut qclass = u16::from(self.qclass);
        if self.unicast_response {
            qclass |= CLASS_MASK_TOP_BIT;
        }

        self.name.serialise(buffer, true);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(qclass);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let mut rclass = u16::from(self.rclass);
        if self.cache_flush {
            rclass |= CLASS_MASK_TOP_BIT;
        }

        self.name.serialise(buffer, true);
        buffer.write_u16(self.rtype_with_data.rtype().into());
        buffer.write_u16(rclass);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            // PTR RDATA may be compressed; SRV and NSEC RDATA must
            // not be (RFC 6762 section 18.14)
            RecordTypeWithData::PTR { ptrname } => ptrname.serialise(buffer, true),
            RecordTypeWithData::TXT { strings } => {
                if strings.is_empty() {
                    // a TXT record with no data is a single empty
                    // string on the wire (RFC 6763 section 6.1)
                    buffer.write_u8(0);
                }
                for s in strings {
                    buffer.write_u8(string_len(s));
                    buffer.write_octets(s);
                }
            }
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, false);
            }
            RecordTypeWithData::NSEC { next_name, types } => {
                next_name.serialise(buffer, false);
                let mut bitmap = BytesMut::new();
                put_nsec_bitmap(&mut bitmap, types);
                buffer.write_octets(&bitmap);
            }
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Serialise a name, using a compression pointer for the longest
    /// suffix of it already present in the message (RFC 1035 section
    /// 4.1.4) if `compress` is true.  Even an uncompressed name
    /// memoises its suffixes, so later names can point into it.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        for i in 0..self.labels.len() {
            if self.labels[i].is_empty() {
                buffer.write_u8(0);
                return;
            }

            let suffix = self.suffix_at(i);
            if compress {
                if let Some(ptr) = buffer.name_pointer(&suffix) {
                    buffer.write_u16(ptr);
                    return;
                }
            }

            buffer.memoise_name(&suffix);
            buffer.write_u8(self.labels[i].len());
            buffer.write_octets(self.labels[i].octets());
        }
    }

    /// The name formed by the labels from `i` onwards.  Upholds the
    /// length invariant since a suffix is no longer than the whole.
    fn suffix_at(&self, i: usize) -> DomainName {
        let labels: Vec<Label> = self.labels[i..].to_vec();
        let len = labels.len() + labels.iter().map(|l| usize::from(l.len())).sum::<usize>();
        DomainName { labels, len }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn string_len(s: &[u8]) -> u8 {
    // TXT strings are validated to 255 octets at construction; clamp
    // rather than corrupt the length prefix if that is ever violated.
    s.len().min(255) as u8
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn memoise_name(&mut self, name: &DomainName) {
        if !name.is_root()
            && self.index() <= MAX_POINTER_TARGET
            && !self.name_pointers.contains_key(name)
        {
            #[allow(clippy::cast_possible_truncation)]
            let index = self.index() as u16;
            let [hi, lo] = index.to_be_bytes();
            self.name_pointers
                .insert(name.clone(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_in() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("printer.local.").serialise(&mut buf, true);
        domain("printer.local.").serialise(&mut buf, true);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                7, 112, 114, 105, 110, 116, 101, 114, // "printer"
                5, 108, 111, 99, 97, 108, 0, // "local"
                // domain 2
                0b1100_0000, 0b0000_0100 // pointer
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("printer.local.").serialise(&mut buf, true);
        domain("printer.local.").serialise(&mut buf, false);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                7, 112, 114, 105, 110, 116, 101, 114, // "printer"
                5, 108, 111, 99, 97, 108, 0, // "local"
                // domain 2
                7, 112, 114, 105, 110, 116, 101, 114, // "printer"
                5, 108, 111, 99, 97, 108, 0, // "local"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_shared_suffix() {
        let mut buf = WritableBuffer::default();
        domain("web.local.").serialise(&mut buf, true);
        domain("api.local.").serialise(&mut buf, true);

        assert_eq!(
            vec![
                // domain 1
                3, 119, 101, 98, // "web"
                5, 108, 111, 99, 97, 108, 0, // "local"
                // domain 2: fresh first label, pointer to "local"
                3, 97, 112, 105, // "api"
                0b1100_0000, 0b0000_0100, // pointer to offset 4
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_qu_bit_sets_top_bit_of_qclass() {
        let mut buf = WritableBuffer::default();
        Question {
            name: domain("printer.local."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
            unicast_response: true,
        }
        .serialise(&mut buf);

        let n = buf.octets.len();
        // qtype A then qclass IN with the top bit set
        assert_eq!(vec![0, 1, 0b1000_0000, 1], buf.octets[n - 4..].to_vec());
    }

    #[test]
    fn test_cache_flush_sets_top_bit_of_rclass() {
        let mut buf = WritableBuffer::default();
        let mut rr = a_record("printer.local.", std::net::Ipv4Addr::new(192, 168, 1, 10));
        rr.cache_flush = true;
        rr.serialise(&mut buf).unwrap();

        // name (15) + type (2), then class
        assert_eq!(vec![0b1000_0000, 1], buf.octets[17..19].to_vec());
    }

    #[test]
    #[rustfmt::skip]
    fn test_srv_target_is_never_compressed() {
        let mut buf = WritableBuffer::default();
        // the target name is already in the buffer, so a compressing
        // serialise would emit a pointer here
        domain("mac.local.").serialise(&mut buf, true);
        srv_record("mac.local.", 631, "mac.local.")
            .serialise(&mut buf)
            .unwrap();

        assert_eq!(
            vec![
                // the earlier name
                3, 109, 97, 99, // "mac"
                5, 108, 111, 99, 97, 108, 0, // "local"
                // NAME: compressed, pointing at offset 0
                0b1100_0000, 0b0000_0000,
                // TYPE
                0, 33,
                // CLASS
                0, 1,
                // TTL
                0, 0, 0, 120,
                // RDLENGTH
                0, 17,
                // RDATA
                0, 0, // priority
                0, 0, // weight
                2, 119, // port 631
                // target, spelled out in full
                3, 109, 97, 99, // "mac"
                5, 108, 111, 99, 97, 108, 0, // "local"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_ptr_rdata_is_compressed() {
        let mut buf = WritableBuffer::default();
        ptr_record("_ipp._tcp.local.", "printer._ipp._tcp.local.")
            .serialise(&mut buf)
            .unwrap();

        assert_eq!(
            vec![
                // NAME
                4, 95, 105, 112, 112, // "_ipp"
                4, 95, 116, 99, 112, // "_tcp"
                5, 108, 111, 99, 97, 108, 0, // "local"
                // TYPE
                0, 12,
                // CLASS
                0, 1,
                // TTL
                0, 0, 0x11, 0x94, // 4500
                // RDLENGTH
                0, 10,
                // RDATA: "printer" + pointer to the owner name
                7, 112, 114, 105, 110, 116, 101, 114,
                0b1100_0000, 0b0000_0000,
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_empty_txt_is_single_zero_octet() {
        let mut buf = WritableBuffer::default();
        txt_record("printer._ipp._tcp.local.", &[]).serialise(&mut buf).unwrap();

        let n = buf.octets.len();
        // RDLENGTH 1, RDATA one zero octet
        assert_eq!(vec![0, 1, 0], buf.octets[n - 3..].to_vec());
    }

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = txt_record("printer._ipp._tcp.local.", &[b"rp=ipp/print", b"qtotal=1"]);
        rr.serialise(&mut buf).unwrap();

        let rdata: &[u8] = &[
            12, 114, 112, 61, 105, 112, 112, 47, 112, 114, 105, 110, 116, // "rp=ipp/print"
            8, 113, 116, 111, 116, 97, 108, 61, 49, // "qtotal=1"
        ];
        let n = buf.octets.len();
        assert_eq!(
            vec![0, 22],
            buf.octets[n - rdata.len() - 2..n - rdata.len()].to_vec()
        );
        assert_eq!(rdata.to_vec(), buf.octets[n - rdata.len()..].to_vec());
    }
}
