//! Fuzz target for frame ring buffer operation sequences.
//!
//! Checks, for any interleaving of writes, reads and close:
//! - Reads return sequences in strictly increasing order
//! - Every read frame carries the bytes written under its sequence
//! - written == read + dropped + still buffered
//! - Nothing is accepted after close

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rust_xray::data::{BufferError, FrameRingBuffer, OverwritePolicy, RingBufferConfig};

#[derive(Debug, Arbitrary)]
enum Op {
    Write(u8),
    Read,
    ReadShort,
    WriteWrongSize(u8),
    Close,
}

#[derive(Debug, Arbitrary)]
struct OpsInput {
    depth: u8,
    frame_size: u8,
    ops: Vec<Op>,
}

fn fill(seq: u64, frame_size: usize) -> Vec<u8> {
    (0..frame_size).map(|i| (seq as u8).wrapping_add(i as u8)).collect()
}

fuzz_target!(|input: OpsInput| {
    let depth = (input.depth % 16) as usize + 1;
    let frame_size = (input.frame_size % 64) as usize + 1;
    // BlockProducer would deadlock a single-threaded driver once full
    let rb = match FrameRingBuffer::new(RingBufferConfig {
        depth,
        frame_size,
        policy: OverwritePolicy::DropOldest,
    }) {
        Ok(rb) => rb,
        Err(_) => return,
    };

    let mut next_write = 0u64;
    let mut last_read: Option<u64> = None;
    let mut reads = 0u64;
    let mut closed = false;
    let mut out = vec![0u8; frame_size];

    for op in input.ops {
        match op {
            Op::Write(_) => {
                let result = rb.write_frame(&fill(next_write, frame_size));
                if closed {
                    assert_eq!(result, Err(BufferError::Closed));
                } else {
                    assert_eq!(result, Ok(next_write));
                    next_write += 1;
                }
            }
            Op::WriteWrongSize(extra) => {
                let bad = vec![0u8; frame_size + 1 + extra as usize];
                assert!(rb.write_frame(&bad).is_err());
            }
            Op::Read => match rb.read_frame(&mut out) {
                Ok(seq) => {
                    if let Some(prev) = last_read {
                        assert!(seq > prev);
                    }
                    assert!(seq < next_write);
                    assert_eq!(out, fill(seq, frame_size));
                    last_read = Some(seq);
                    reads += 1;
                }
                Err(BufferError::Empty) => assert!(!closed && rb.is_empty()),
                Err(BufferError::Closed) => assert!(closed && rb.is_empty()),
                Err(e) => panic!("unexpected read error {e}"),
            },
            Op::ReadShort => {
                if frame_size > 1 {
                    let mut short = vec![0u8; frame_size - 1];
                    let before = rb.available_frame_count();
                    assert!(rb.read_frame(&mut short).is_err());
                    assert_eq!(rb.available_frame_count(), before);
                }
            }
            Op::Close => {
                rb.close();
                closed = true;
            }
        }

        let stats = rb.stats();
        assert!(rb.available_frame_count() <= depth);
        assert_eq!(stats.written, next_write);
        assert_eq!(stats.read, reads);
        assert_eq!(
            stats.written,
            stats.read + stats.dropped + rb.available_frame_count() as u64
        );
    }
});
