//! A typed message bus over POSIX shared memory.
//!
//! Payloads are constructed in place inside a shared [`Arena`]; only a small
//! locator travels through a [`MessageQueue`]. Any process that opens the same
//! arena and queue names can send and receive.
//!
//! ```no_run
//! use shmbus::{Arena, Handlers, Message, Receiver, Sender};
//!
//! #[derive(Message)]
//! #[repr(C)]
//! struct Ping {
//!     seq: u32,
//! }
//!
//! # fn main() -> shmbus::Result<()> {
//! let arena = Arena::open_or_create("/demo-arena", 1 << 20)?;
//! let sender = Sender::open(&arena, "/demo-queue")?;
//! let receiver = Receiver::open(&arena, "/demo-queue")?;
//!
//! sender.send(Ping { seq: 1 })?;
//! let mut handlers = Handlers::new().on(|ping: &mut Ping| println!("ping {}", ping.seq));
//! assert!(receiver.receive(&mut handlers)?);
//! # Ok(())
//! # }
//! ```

extern crate self as shmbus;

pub mod arena;
pub mod envelope;
pub mod error;
mod heap;
pub mod message;
mod mmap_raw;
pub mod queue;
pub mod receipt;
pub mod receiver;
pub mod segment;
pub mod sender;
mod string;
pub mod sync;

pub use arena::{Arena, ArenaAllocator};
pub use envelope::{Envelope, EnvelopeTable};
pub use error::{Error, ErrorKind, Result};
pub use message::{Message, Tag};
pub use queue::MessageQueue;
pub use receipt::Receipt;
pub use receiver::{Delivery, Disposition, Handlers, IntoDisposition, Receiver};
pub use sender::Sender;
pub use shmbus_derive::Message;
pub use string::SharedStr;
