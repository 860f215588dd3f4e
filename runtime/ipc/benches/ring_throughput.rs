//! Ring produce/consume throughput

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ree_ipc::{Action, Message, MessageRing, NotificationRegister, NotifyBits};
use std::hint::black_box;
use std::sync::atomic::AtomicU32;

fn bench_ring_batches(c: &mut Criterion) {
    let ring = MessageRing::default();
    let mut group = c.benchmark_group("ring");

    for batch in [1usize, 8, 64, 140] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("produce_consume", batch), &batch, |b, &n| {
            b.iter(|| {
                let mut producer = ring.producer();
                for i in 0..n {
                    let msg = Message::new((i % 28) as u8, Action::Request)
                        .with_payload(i as u64, 0);
                    producer.produce(msg).unwrap();
                }
                producer.commit();

                let mut consumer = ring.consumer();
                for msg in consumer.by_ref() {
                    black_box(msg.unwrap());
                }
                consumer.commit();
            })
        });
    }
    group.finish();
}

fn bench_notify(c: &mut Criterion) {
    let word = AtomicU32::new(0);
    let reg = NotificationRegister::new(&word);

    c.bench_function("notify_raise_take", |b| {
        b.iter(|| {
            black_box(reg.raise(NotifyBits::MESSAGE));
            black_box(reg.take());
        })
    });
}

criterion_group!(benches, bench_ring_batches, bench_notify);
criterion_main!(benches);
