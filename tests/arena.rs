mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use common::Names;
use pretty_assertions::assert_eq;
use shmbus::arena::MIN_ARENA_SIZE;
use shmbus::{Arena, ErrorKind, MessageQueue, Result, SharedStr};

#[test]
fn named_objects_are_shared_between_handles() -> Result<()> {
    let names = Names::new("named");
    let first = Arena::open_or_create(&names.arena, 65536)?;
    let second = Arena::open(&names.arena)?;

    let counter = first.find_or_construct("counter", || AtomicU64::new(41))?;
    let mut calls = 0;
    let same = second.find_or_construct("counter", || {
        calls += 1;
        AtomicU64::new(0)
    })?;
    assert_eq!(calls, 0);

    same.fetch_add(1, Ordering::SeqCst);
    assert_eq!(counter.load(Ordering::SeqCst), 42);
    assert!(second.find::<AtomicU64>("counter")?.is_some());
    assert!(second.find::<AtomicU64>("missing")?.is_none());
    Ok(())
}

#[test]
fn destroy_returns_storage() -> Result<()> {
    let names = Names::new("destroy");
    let arena = Arena::open_or_create(&names.arena, 65536)?;
    let initial = arena.free_memory()?;

    arena.find_or_construct("block", || [0u64; 64])?;
    assert!(arena.free_memory()? < initial);
    assert!(arena.destroy::<[u64; 64]>("block")?);
    assert!(!arena.destroy::<[u64; 64]>("block")?);
    assert_eq!(arena.free_memory()?, initial);
    Ok(())
}

#[test]
fn shared_strings_resolve_in_every_mapping() -> Result<()> {
    let names = Names::new("strings");
    let writer = Arena::open_or_create(&names.arena, 65536)?;
    let reader = Arena::open(&names.arena)?;

    let initial = writer.free_memory()?;
    let mut s = SharedStr::new(&writer, "hello from another mapping")?;
    assert_eq!(s.as_str(&reader)?, "hello from another mapping");
    assert_eq!(s.len(), "hello from another mapping".len());

    s.free(&writer)?;
    assert!(s.is_empty());
    s.free(&writer)?;
    assert_eq!(reader.free_memory()?, initial);
    Ok(())
}

#[test]
fn reopening_keeps_contents() -> Result<()> {
    let names = Names::new("reopen");
    {
        let arena = Arena::open_or_create(&names.arena, 65536)?;
        arena.find_or_construct("answer", || 42u32)?;
    }
    let arena = Arena::open_or_create(&names.arena, 65536)?;
    assert_eq!(arena.find::<u32>("answer")?.copied(), Some(42));
    Ok(())
}

#[test]
fn opening_a_missing_arena_fails() {
    let names = Names::new("missing");
    let err = Arena::open(&names.arena).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Io(_)));
}

#[test]
fn queue_blocks_until_space_is_available() -> Result<()> {
    let names = Names::new("queue-full");
    let queue = MessageQueue::<u64>::open_or_create(&names.queue, 2)?;
    assert!(queue.try_send(1)?);
    assert!(queue.try_send(2)?);
    assert!(!queue.try_send(3)?);
    assert!(queue.is_full()?);

    thread::scope(|s| -> Result<()> {
        let consumer = s.spawn(|| -> Result<Option<u64>> {
            let queue = MessageQueue::<u64>::open(&names.queue)?;
            thread::sleep(Duration::from_millis(50));
            queue.recv_timeout(Duration::from_secs(1))
        });
        queue.send(3)?;
        assert_eq!(consumer.join().unwrap()?, Some(1));
        Ok(())
    })?;

    assert_eq!(queue.try_recv()?, Some(2));
    assert_eq!(queue.try_recv()?, Some(3));
    assert_eq!(queue.try_recv()?, None);
    Ok(())
}

#[test]
fn undersized_arena_is_rejected() {
    let names = Names::new("tiny");
    let err = Arena::open_or_create(&names.arena, 1024).unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::TooSmall {
            len: 1024,
            required: MIN_ARENA_SIZE
        }
    ));
    // Nothing was left behind under the name.
    assert!(matches!(
        Arena::open(&names.arena).unwrap_err().kind(),
        ErrorKind::Io(_)
    ));
}

#[test]
fn attaching_to_a_smaller_foreign_segment_fails() -> Result<()> {
    let names = Names::new("foreign");
    let _queue = MessageQueue::<u64>::open_or_create(&names.arena, 1)?;
    let err = Arena::open(&names.arena).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TooSmall { .. }));
    let err = Arena::open_or_create(&names.arena, 65536).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TooSmall { .. }));
    Ok(())
}

#[test]
fn oversized_allocation_is_an_error() -> Result<()> {
    let names = Names::new("oversized");
    let arena = Arena::options()
        .mode(0o600)
        .open_or_create(&names.arena, 65536)?;
    let free = arena.free_memory()?;
    let err = arena.allocator::<u8>().allocate(usize::MAX - 4).unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::AllocationFailure { requested, .. } if *requested == usize::MAX - 4
    ));
    assert_eq!(arena.free_memory()?, free);
    Ok(())
}
