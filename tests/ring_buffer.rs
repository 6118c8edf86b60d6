//! Frame ring buffer behaviour under both overwrite policies.

use rust_xray::data::{BufferError, FrameRingBuffer, OverwritePolicy, RingBufferConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const FRAME: usize = 64;

fn buffer(depth: usize, policy: OverwritePolicy) -> FrameRingBuffer {
    FrameRingBuffer::new(RingBufferConfig {
        depth,
        frame_size: FRAME,
        policy,
    })
    .unwrap()
}

/// Distinct, recognisable content per frame index.
fn frame(index: u64) -> Vec<u8> {
    (0..FRAME)
        .map(|i| (index as u8).wrapping_mul(31).wrapping_add(i as u8))
        .collect()
}

#[test]
fn reads_return_writes_in_order() {
    let rb = buffer(4, OverwritePolicy::DropOldest);
    for i in 0..3 {
        assert_eq!(rb.write_frame(&frame(i)).unwrap(), i);
    }

    let mut out = vec![0u8; FRAME];
    for i in 0..3 {
        assert_eq!(rb.read_frame(&mut out).unwrap(), i);
        assert_eq!(out, frame(i));
    }
    assert_eq!(rb.read_frame(&mut out), Err(BufferError::Empty));
}

#[test]
fn drop_oldest_keeps_most_recent_depth_frames() {
    let depth = 5;
    let extra = 7;
    let rb = buffer(depth, OverwritePolicy::DropOldest);
    for i in 0..(depth + extra) as u64 {
        rb.write_frame(&frame(i)).unwrap();
    }

    assert!(rb.is_full());
    assert_eq!(rb.available_frame_count(), depth);
    let stats = rb.stats();
    assert_eq!(stats.written, (depth + extra) as u64);
    assert_eq!(stats.dropped, extra as u64);

    let mut out = vec![0u8; FRAME];
    for expected in extra as u64..(depth + extra) as u64 {
        assert_eq!(rb.read_frame(&mut out).unwrap(), expected);
        assert_eq!(out, frame(expected));
    }
    assert!(rb.is_empty());
}

#[test]
fn depth_one_block_producer_alternates() {
    let rb = Arc::new(buffer(1, OverwritePolicy::BlockProducer));
    let writer = {
        let rb = Arc::clone(&rb);
        thread::spawn(move || {
            for i in 0..20 {
                rb.write_frame(&frame(i)).unwrap();
            }
        })
    };

    let mut out = vec![0u8; FRAME];
    for i in 0..20 {
        let sequence = rb.read_frame_timeout(&mut out, Duration::from_secs(5)).unwrap();
        assert_eq!(sequence, i);
        assert_eq!(out, frame(i));
    }
    writer.join().unwrap();
    assert_eq!(rb.stats().dropped, 0);
}

#[test]
fn block_producer_waits_for_a_free_slot() {
    let rb = Arc::new(buffer(2, OverwritePolicy::BlockProducer));
    rb.write_frame(&frame(0)).unwrap();
    rb.write_frame(&frame(1)).unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let writer = {
        let rb = Arc::clone(&rb);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let sequence = rb.write_frame(&frame(2)).unwrap();
            finished.store(true, Ordering::SeqCst);
            sequence
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!finished.load(Ordering::SeqCst), "writer must block while full");
    assert_eq!(rb.available_frame_count(), 2);

    let mut out = vec![0u8; FRAME];
    assert_eq!(rb.read_frame(&mut out).unwrap(), 0);
    assert_eq!(writer.join().unwrap(), 2);
    assert!(finished.load(Ordering::SeqCst));

    assert_eq!(rb.read_frame(&mut out).unwrap(), 1);
    assert_eq!(rb.read_frame(&mut out).unwrap(), 2);
    assert_eq!(out, frame(2));
}

#[test]
fn close_drains_then_reports_closed() {
    let rb = buffer(4, OverwritePolicy::DropOldest);
    rb.write_frame(&frame(0)).unwrap();
    rb.write_frame(&frame(1)).unwrap();
    rb.close();

    assert!(rb.is_closed());
    assert_eq!(rb.write_frame(&frame(2)), Err(BufferError::Closed));

    let mut out = vec![0u8; FRAME];
    assert_eq!(rb.read_frame_timeout(&mut out, Duration::from_millis(10)).unwrap(), 0);
    assert_eq!(rb.read_frame_owned().unwrap().sequence, 1);
    assert_eq!(rb.read_frame(&mut out), Err(BufferError::Closed));
    assert_eq!(
        rb.read_frame_timeout(&mut out, Duration::from_millis(10)),
        Err(BufferError::Closed)
    );
}

#[test]
fn close_wakes_waiting_reader() {
    let rb = Arc::new(buffer(2, OverwritePolicy::DropOldest));
    let reader = {
        let rb = Arc::clone(&rb);
        thread::spawn(move || {
            let mut out = vec![0u8; FRAME];
            rb.read_frame_timeout(&mut out, Duration::from_secs(30))
        })
    };
    thread::sleep(Duration::from_millis(50));
    rb.close();
    assert_eq!(reader.join().unwrap(), Err(BufferError::Closed));
}

#[test]
fn callback_sees_every_write_and_drop() {
    let rb = buffer(2, OverwritePolicy::DropOldest);
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        rb.set_frame_callback(move |written| {
            assert_eq!(written.data.len(), FRAME);
            seen.lock().unwrap().push((written.sequence, written.dropped_oldest));
        });
    }

    for i in 0..4 {
        rb.write_frame(&frame(i)).unwrap();
    }
    rb.clear_frame_callback();
    rb.write_frame(&frame(4)).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(0, false), (1, false), (2, true), (3, true)]
    );
}

#[test]
fn mismatched_sizes_are_rejected_without_side_effects() {
    let rb = buffer(2, OverwritePolicy::DropOldest);
    assert_eq!(
        rb.write_frame(&[0u8; FRAME - 1]),
        Err(BufferError::FrameSizeMismatch {
            expected: FRAME,
            actual: FRAME - 1
        })
    );
    assert!(rb.is_empty());
    assert_eq!(rb.stats().written, 0);

    rb.write_frame(&frame(0)).unwrap();
    let mut small = vec![0u8; FRAME / 2];
    assert!(matches!(
        rb.read_frame(&mut small),
        Err(BufferError::FrameSizeMismatch { .. })
    ));
    assert_eq!(rb.available_frame_count(), 1);
}

#[test]
fn concurrent_drop_oldest_never_reorders() {
    let rb = Arc::new(buffer(3, OverwritePolicy::DropOldest));
    let total = 2_000u64;
    let done = Arc::new(AtomicBool::new(false));
    let last_seen = Arc::new(AtomicU64::new(0));

    let writer = {
        let rb = Arc::clone(&rb);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..total {
                rb.write_frame(&frame(i)).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut out = vec![0u8; FRAME];
    let mut previous: Option<u64> = None;
    loop {
        match rb.read_frame_timeout(&mut out, Duration::from_millis(20)) {
            Ok(sequence) => {
                if let Some(prev) = previous {
                    assert!(sequence > prev, "{sequence} after {prev}");
                }
                assert_eq!(out, frame(sequence));
                previous = Some(sequence);
                last_seen.store(sequence, Ordering::SeqCst);
            }
            Err(BufferError::Timeout) if done.load(Ordering::SeqCst) && rb.is_empty() => break,
            Err(BufferError::Timeout) => {}
            Err(e) => panic!("unexpected {e}"),
        }
    }
    writer.join().unwrap();

    let stats = rb.stats();
    assert_eq!(stats.written, total);
    assert_eq!(stats.read + stats.dropped, total);
    assert_eq!(last_seen.load(Ordering::SeqCst), total - 1);
}
