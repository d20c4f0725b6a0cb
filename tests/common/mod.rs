#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use shmbus::{Arena, MessageQueue};

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// Unique arena and queue names for one test, unlinked on drop.
pub struct Names {
    pub arena: String,
    pub queue: String,
}

impl Names {
    pub fn new(tag: &str) -> Self {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        Names {
            arena: format!("/shmbus-{tag}-{pid}-{n}"),
            queue: format!("/shmbus-{tag}-{pid}-{n}-mq"),
        }
    }
}

impl Drop for Names {
    fn drop(&mut self) {
        let _ = Arena::remove(&self.arena);
        let _ = MessageQueue::<u64>::remove(&self.queue);
    }
}
