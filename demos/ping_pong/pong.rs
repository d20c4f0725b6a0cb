#[path = "messages.rs"]
pub mod messages;

use std::cell::Cell;
use std::process::Command;

use messages::{Done, Ping, Pong, ARENA, PINGS, PONGS};
use shmbus::{Arena, Handlers, MessageQueue, Receiver, Result, Sender};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let n = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<u32>().ok())
        .unwrap_or(1000);

    let arena = Arena::open_or_create(ARENA, 1 << 20)?;
    let tx = Sender::open(&arena, PONGS)?;
    let rx = Receiver::open(&arena, PINGS)?;

    let mut ping = Command::new("target/debug/examples/ping").spawn()?;

    let seen = Cell::new(0);
    let mut handlers = Handlers::new().on(|ping: &mut Ping| seen.set(ping.seq));
    for seq in 0..n {
        // Wait for ping to post.
        while !rx.receive(&mut handlers)? {}
        assert_eq!(seen.get(), seq);

        tx.send(Pong { seq })?;
    }

    tx.send(Done)?;
    ping.wait()?;
    info!(n, "ping pong finished");

    Arena::remove(ARENA)?;
    MessageQueue::<u64>::remove(PINGS)?;
    MessageQueue::<u64>::remove(PONGS)?;
    Ok(())
}
