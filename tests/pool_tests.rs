use loragw_rs::util::pool::PoolHandle;
use loragw_rs::{GatewayError, MessagePool};
use std::sync::Arc;

#[test]
fn exhaustion_is_a_distinct_error() {
    let pool: MessagePool<u64> = MessagePool::new("records", 3);
    for _ in 0..3 {
        pool.acquire().unwrap();
    }
    match pool.acquire() {
        Err(GatewayError::PoolExhausted(name)) => assert_eq!(name, "records"),
        other => panic!("expected pool exhaustion, got {other:?}"),
    }
}

#[test]
fn release_reopens_acceptance() {
    let pool: MessagePool<u64> = MessagePool::new("records", 2);
    let a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    assert!(pool.acquire().is_err());
    assert!(pool.release(a));
    let c = pool.acquire().unwrap();
    assert_eq!(c, a);
}

#[test]
fn slots_reset_between_uses() {
    let pool: MessagePool<Vec<u8>> = MessagePool::new("records", 1);
    let idx = pool.acquire().unwrap();
    pool.with_slot(idx, |v| v.extend_from_slice(&[1, 2, 3]));
    pool.release(idx);
    let idx = pool.acquire().unwrap();
    assert_eq!(pool.with_slot(idx, |v| v.len()), Some(0));
}

#[test]
fn ready_flag_only_on_busy_slots() {
    let pool: MessagePool<u64> = MessagePool::new("records", 2);
    assert!(!pool.mark_ready(0));
    assert!(!pool.is_ready(0));
    let idx = pool.acquire().unwrap();
    assert!(!pool.is_ready(idx));
    assert!(pool.mark_ready(idx));
    assert!(pool.is_ready(idx));
    pool.release(idx);
    assert!(!pool.is_ready(idx));
}

#[test]
fn out_of_range_indexes_are_rejected() {
    let pool: MessagePool<u64> = MessagePool::new("records", 1);
    assert!(!pool.release(9));
    assert!(!pool.mark_ready(9));
    assert!(pool.with_slot(9, |_| ()).is_none());
}

#[test]
fn concurrent_acquire_release_never_double_allocates() {
    let pool = Arc::new(MessagePool::<u64>::new("records", 8));
    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let pool = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            for round in 0..200u64 {
                if let Ok(idx) = pool.acquire() {
                    let tag = worker * 1_000 + round;
                    pool.with_slot(idx, |v| *v = tag);
                    // Nobody else may have touched our slot.
                    assert_eq!(pool.with_slot(idx, |v| *v), Some(tag));
                    assert!(pool.release(idx));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn handle_returns_slot_when_dropped() {
    let pool = Arc::new(MessagePool::<Vec<u8>>::new("records", 2));
    let handle = PoolHandle::acquire(&pool).unwrap();
    handle.with(|v| v.push(0xAB));
    handle.mark_ready();
    assert_eq!(handle.take(), Some(vec![0xAB]));
    assert_eq!(pool.in_use(), 1);
    drop(handle);
    assert_eq!(pool.in_use(), 0);
}
