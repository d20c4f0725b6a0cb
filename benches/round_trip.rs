use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use shmbus::{Arena, Error, Handlers, Message, MessageQueue, Receiver, Sender, SharedStr};

const ARENA: &str = "/shmbus-bench";
const QUEUE: &str = "/shmbus-bench-mq";

#[derive(Message)]
#[repr(C)]
struct Sample {
    seq: u64,
    payload: [u8; 64],
}

#[repr(C)]
struct Note {
    text: SharedStr,
}

unsafe impl Message for Note {
    const NAME: &'static str = "bench.note";

    fn release(&mut self, arena: &Arena) -> shmbus::Result<()> {
        self.text.free(arena)
    }
}

fn bench(c: &mut Criterion) {
    let n = 1000;

    let arena = Arena::open_or_create(ARENA, 1 << 22).unwrap();
    let tx = Sender::open(&arena, QUEUE).unwrap();
    let rx = Receiver::open(&arena, QUEUE).unwrap();

    let mut group = c.benchmark_group("round_trip_throughput");
    group.throughput(Throughput::Elements(n));

    group.bench_function("fixed_size", |b| {
        let mut handlers = Handlers::new().on(|sample: &mut Sample| {
            criterion::black_box(sample.seq);
        });
        b.iter(|| {
            for seq in 0..n {
                tx.send(Sample {
                    seq,
                    payload: [0; 64],
                })
                .unwrap();
                assert!(rx.receive(&mut handlers).unwrap());
            }
        })
    });

    group.bench_function("shared_string", |b| {
        let mut handlers = Handlers::new().on(|note: &mut Note| {
            criterion::black_box(note.text.len());
        });
        b.iter(|| {
            for _ in 0..n {
                tx.send_with(|arena| {
                    Ok::<_, Error>(Note {
                        text: SharedStr::new(arena, "a short note")?,
                    })
                })
                .unwrap();
                assert!(rx.receive(&mut handlers).unwrap());
            }
        })
    });
    group.finish();

    drop((tx, rx));
    Arena::remove(ARENA).unwrap();
    MessageQueue::<u64>::remove(QUEUE).unwrap();
}

criterion_group!(benches, bench);
criterion_main!(benches);
