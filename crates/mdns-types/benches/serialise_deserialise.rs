use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::net::Ipv4Addr;

use mdns_types::protocol::types::test_util::*;
use mdns_types::protocol::types::*;

#[allow(non_snake_case)]
fn bench__browse_question(c: &mut Criterion) {
    let message = Message::query(vec![Question::new(
        domain("_ipp._tcp.local."),
        QueryType::Record(RecordType::PTR),
    )]);

    c.bench_function("serialise/browse_question", |b| {
        b.iter_batched(
            || message.clone(),
            |message| message.to_octets(),
            BatchSize::SmallInput,
        )
    });

    let serialised = message.to_octets().unwrap();
    c.bench_function("deserialise/browse_question", |b| {
        b.iter(|| Message::from_octets(black_box(&serialised)))
    });
}

#[allow(non_snake_case)]
fn bench__service_announcement(c: &mut Criterion) {
    let mut message = Message::response();
    message.answers = vec![
        ptr_record("_ipp._tcp.local.", "printer._ipp._tcp.local."),
        srv_record("printer._ipp._tcp.local.", 631, "mac.local."),
        txt_record("printer._ipp._tcp.local.", &[b"rp=printers/ipp"]),
        a_record("mac.local.", Ipv4Addr::new(192, 168, 1, 10)),
    ];
    message.additional = vec![
        nsec_record(
            "printer._ipp._tcp.local.",
            &[RecordType::SRV, RecordType::TXT],
        ),
        nsec_record("mac.local.", &[RecordType::A]),
    ];

    c.bench_function("serialise/service_announcement", |b| {
        b.iter_batched(
            || message.clone(),
            |message| message.to_octets(),
            BatchSize::SmallInput,
        )
    });

    let serialised = message.to_octets().unwrap();
    c.bench_function("deserialise/service_announcement", |b| {
        b.iter(|| Message::from_octets(black_box(&serialised)))
    });
}

criterion_group!(
    benches,
    bench__browse_question,
    bench__service_announcement
);
criterion_main!(benches);
