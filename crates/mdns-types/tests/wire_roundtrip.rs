use bytes::Bytes;
use fake::{Fake, Faker};

use mdns_types::protocol::deserialise::ConsumableBuffer;
use mdns_types::protocol::serialise::WritableBuffer;
use mdns_types::protocol::types::*;

#[test]
fn roundtrip_message() {
    for _ in 0..100 {
        let original = arbitrary_message();
        let deserialised = Message::from_octets(&original.to_octets().unwrap());

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_question() {
    for _ in 0..100 {
        let original = arbitrary_question();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer);
        let deserialised = Question::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_resourcerecord() {
    for _ in 0..100 {
        let original = arbitrary_resourcerecord();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer).unwrap();
        let deserialised =
            ResourceRecord::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_domainname() {
    for _ in 0..100 {
        let original = arbitrary_domainname();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer, true);
        let deserialised = DomainName::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_preserves_mdns_class_bits() {
    for _ in 0..100 {
        let mut message = Message::response();
        let mut question = arbitrary_question();
        question.unicast_response = true;
        message.questions.push(question);

        let mut rr = arbitrary_resourcerecord();
        rr.cache_flush = true;
        message.answers.push(rr);

        let parsed = Message::from_octets(&message.to_octets().unwrap()).unwrap();
        assert!(parsed.questions[0].unicast_response);
        assert!(parsed.answers[0].cache_flush);
        assert_eq!(message, parsed);
    }
}

fn arbitrary_message() -> Message {
    let qdcount = (0..4).fake();
    let ancount = (0..4).fake();
    let nscount = (0..4).fake();
    let arcount = (0..4).fake();

    let mut questions = Vec::with_capacity(qdcount);
    let mut answers = Vec::with_capacity(ancount);
    let mut authority = Vec::with_capacity(nscount);
    let mut additional = Vec::with_capacity(arcount);

    for _ in 0..qdcount {
        questions.push(arbitrary_question());
    }
    for _ in 0..ancount {
        answers.push(arbitrary_resourcerecord());
    }
    for _ in 0..nscount {
        authority.push(arbitrary_resourcerecord());
    }
    for _ in 0..arcount {
        additional.push(arbitrary_resourcerecord());
    }

    Message {
        header: arbitrary_header(),
        questions,
        answers,
        authority,
        additional,
    }
}

fn arbitrary_header() -> Header {
    Header {
        id: Faker.fake(),
        is_response: Faker.fake(),
        opcode: arbitrary_opcode(),
        is_authoritative: Faker.fake(),
        is_truncated: Faker.fake(),
        recursion_desired: Faker.fake(),
        recursion_available: Faker.fake(),
        rcode: arbitrary_rcode(),
    }
}

fn arbitrary_question() -> Question {
    Question {
        name: arbitrary_domainname(),
        qtype: Faker.fake::<u16>().into(),
        qclass: QueryClass::from(Faker.fake::<u16>()),
        unicast_response: Faker.fake(),
    }
}

fn arbitrary_resourcerecord() -> ResourceRecord {
    ResourceRecord {
        name: arbitrary_domainname(),
        rtype_with_data: arbitrary_recordtypewithdata(),
        rclass: RecordClass::from(Faker.fake::<u16>()),
        cache_flush: Faker.fake(),
        ttl: Faker.fake(),
    }
}

fn arbitrary_recordtypewithdata() -> RecordTypeWithData {
    // this should match the `RecordTypeWithData` deserialisation
    match Faker.fake::<u16>().into() {
        RecordType::A => RecordTypeWithData::A {
            address: std::net::Ipv4Addr::from(Faker.fake::<u32>()),
        },
        RecordType::PTR => RecordTypeWithData::PTR {
            ptrname: arbitrary_domainname(),
        },
        RecordType::TXT => {
            let num_strings = (0..3).fake();
            let mut strings = Vec::with_capacity(num_strings);
            for _ in 0..num_strings {
                strings.push(arbitrary_octets((1..16).fake()));
            }
            RecordTypeWithData::TXT { strings }
        }
        RecordType::SRV => RecordTypeWithData::SRV {
            priority: Faker.fake(),
            weight: Faker.fake(),
            port: Faker.fake(),
            target: arbitrary_domainname(),
        },
        RecordType::NSEC => RecordTypeWithData::NSEC {
            next_name: arbitrary_domainname(),
            // a sorted subset of the known types, matching what
            // decoding a window-zero bitmap produces
            types: vec![RecordType::A, RecordType::SRV],
        },
        RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
            tag,
            octets: arbitrary_octets((0..64).fake()),
        },
    }
}

fn arbitrary_domainname() -> DomainName {
    let num_labels = (1..5).fake::<usize>();
    let mut labels = Vec::<Label>::new();

    for _ in 0..num_labels {
        let label_len = (1..20).fake::<usize>();
        let mut octets = Vec::with_capacity(label_len);

        for _ in 0..label_len {
            let mut octet = (32..126).fake::<u8>();
            if octet == b'.' || (octet as char).is_whitespace() {
                octet = b'x';
            }
            octets.push(octet);
        }

        labels.push(Label::try_from(&octets[..]).unwrap());
    }

    labels.push(Label::new());
    DomainName::from_labels(labels).unwrap()
}

fn arbitrary_opcode() -> Opcode {
    // opcode is a 4-bit field
    (Faker.fake::<u8>() & 0b0000_1111).into()
}

fn arbitrary_rcode() -> Rcode {
    // rcode is a 4-bit field
    (Faker.fake::<u8>() & 0b0000_1111).into()
}

fn arbitrary_octets(len: usize) -> Bytes {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(Faker.fake());
    }
    Bytes::from(out)
}
