#[path = "messages.rs"]
pub mod messages;

use std::cell::Cell;

use messages::{Done, Ping, Pong, ARENA, PINGS, PONGS};
use shmbus::{Arena, Handlers, Receiver, Result, Sender};

fn main() -> Result<()> {
    let arena = Arena::open(ARENA)?;
    let tx = Sender::open(&arena, PINGS)?;
    let rx = Receiver::open(&arena, PONGS)?;

    let done = Cell::new(false);
    let mut seq = 0;
    loop {
        // Send a ping.
        tx.send(Ping { seq })?;

        // Wait for pong to post.
        let mut handlers = Handlers::new()
            .on(|pong: &mut Pong| assert_eq!(pong.seq, seq))
            .on(|_: &mut Done| done.set(true));
        while !rx.receive(&mut handlers)? {}
        drop(handlers);

        if done.get() {
            break;
        }
        seq += 1;
    }
    Ok(())
}
