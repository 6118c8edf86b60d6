//! Bounded frame ring buffer between the detector capture thread and the
//! processing consumers.
//!
//! The buffer holds `depth` fixed-size frame slots in a single anonymous
//! memory mapping allocated at construction. A single producer (the capture
//! adapter driven by detector hardware) writes whole frames; consumers pop the
//! oldest unread frame.
//!
//! # Overwrite policies
//! - [`OverwritePolicy::DropOldest`]: a full buffer discards its oldest unread
//!   frame and reuses the slot. The producer never waits, the buffer always
//!   holds the most recent `depth` frames.
//! - [`OverwritePolicy::BlockProducer`]: a full buffer suspends the writer until
//!   a read frees a slot. No frame is ever lost, at the cost of stalling capture.
//!
//! # Memory Layout
//! ```text
//! [slot 0: frame_size bytes] [slot 1] ... [slot depth-1]
//!
//! head  = slot index of the oldest unread frame
//! count = number of unread frames
//! next write slot = (head + count) % depth
//! ```
//!
//! Sequence numbers are assigned under the buffer lock and strictly increase
//! across the buffer's lifetime; reads always come out in capture order.

use memmap2::MmapMut;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

/// What a full buffer does with a new write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Discard the oldest unread frame.
    #[default]
    DropOldest,
    /// Block the writer until a slot is freed.
    BlockProducer,
}

impl std::fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverwritePolicy::DropOldest => write!(f, "drop_oldest"),
            OverwritePolicy::BlockProducer => write!(f, "block_producer"),
        }
    }
}

/// Ring buffer failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Construction parameters are unusable.
    #[error("invalid ring buffer configuration: {0}")]
    InvalidConfiguration(String),
    /// A write or read buffer does not match the configured frame size.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch {
        /// Configured frame size
        expected: usize,
        /// Size supplied by the caller
        actual: usize,
    },
    /// No unread frame is available.
    #[error("ring buffer is empty")]
    Empty,
    /// The buffer was closed for shutdown.
    #[error("ring buffer is closed")]
    Closed,
    /// No frame arrived within the requested wait.
    #[error("timed out waiting for a frame")]
    Timeout,
}

/// Construction parameters for [`FrameRingBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferConfig {
    /// Number of frame slots (at least 1)
    pub depth: usize,
    /// Size of every frame in bytes (non-zero)
    pub frame_size: usize,
    /// Behavior when all slots hold unread frames
    pub policy: OverwritePolicy,
}

/// Notification passed to the write callback.
#[derive(Debug, Clone, Copy)]
pub struct FrameWritten<'a> {
    /// Sequence number assigned to the frame
    pub sequence: u64,
    /// The bytes that were written
    pub data: &'a [u8],
    /// Whether an unread frame was discarded to make room
    pub dropped_oldest: bool,
}

/// Callback fired synchronously on the writer's thread after each successful
/// write, outside the buffer lock. It must not write to the same buffer.
pub type FrameCallback = Arc<dyn Fn(FrameWritten<'_>) + Send + Sync>;

/// A frame copied out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Sequence number assigned at write time
    pub sequence: u64,
    /// Frame bytes
    pub data: Vec<u8>,
}

/// Counters describing the buffer's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Frames accepted by `write_frame`
    pub written: u64,
    /// Frames handed to readers
    pub read: u64,
    /// Unread frames discarded under drop-oldest
    pub dropped: u64,
}

struct SlotState {
    /// Backing storage for all slots
    storage: MmapMut,
    /// Sequence number stored in each slot
    sequences: Vec<u64>,
    /// Slot index of the oldest unread frame
    head: usize,
    /// Unread frame count
    count: usize,
    /// Sequence number for the next write
    next_sequence: u64,
    closed: bool,
}

/// Fixed-capacity, fixed-frame-size circular frame buffer.
///
/// Shared between threads behind an `Arc`; all methods take `&self`.
pub struct FrameRingBuffer {
    config: RingBufferConfig,
    state: Mutex<SlotState>,
    not_empty: Condvar,
    not_full: Condvar,
    callback: RwLock<Option<FrameCallback>>,
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for FrameRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRingBuffer")
            .field("config", &self.config)
            .field("available", &self.available_frame_count())
            .finish_non_exhaustive()
    }
}

impl FrameRingBuffer {
    /// Create a buffer with `depth` slots of `frame_size` bytes each.
    ///
    /// `depth == 1` is a valid configuration: under drop-oldest every write
    /// replaces the single unread frame, under block-producer the writer waits
    /// for each frame to be read.
    pub fn new(config: RingBufferConfig) -> Result<Self, BufferError> {
        if config.depth == 0 {
            return Err(BufferError::InvalidConfiguration(
                "depth must be at least 1".into(),
            ));
        }
        if config.frame_size == 0 {
            return Err(BufferError::InvalidConfiguration(
                "frame size must be greater than 0".into(),
            ));
        }
        let total = config.depth.checked_mul(config.frame_size).ok_or_else(|| {
            BufferError::InvalidConfiguration("depth * frame_size overflows".into())
        })?;

        let storage = MmapMut::map_anon(total).map_err(|e| {
            BufferError::InvalidConfiguration(format!(
                "failed to map {total} bytes of frame storage: {e}"
            ))
        })?;

        info!(
            depth = config.depth,
            frame_size = config.frame_size,
            policy = %config.policy,
            total_mb = total as f64 / (1024.0 * 1024.0),
            "Frame ring buffer created"
        );

        Ok(Self {
            config,
            state: Mutex::new(SlotState {
                storage,
                sequences: vec![0; config.depth],
                head: 0,
                count: 0,
                next_sequence: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            callback: RwLock::new(None),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Configuration the buffer was created with.
    pub fn config(&self) -> RingBufferConfig {
        self.config
    }

    /// Configured frame size in bytes.
    pub fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    /// Number of slots.
    pub fn depth(&self) -> usize {
        self.config.depth
    }

    /// Register the per-write callback, replacing any previous one.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(FrameWritten<'_>) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Remove the per-write callback.
    pub fn clear_frame_callback(&self) {
        *self.callback.write() = None;
    }

    /// Copy one frame into the next slot and return its sequence number.
    ///
    /// Fails with [`BufferError::FrameSizeMismatch`] unless `data` is exactly
    /// the configured frame size. Under block-producer this waits while the
    /// buffer is full.
    pub fn write_frame(&self, data: &[u8]) -> Result<u64, BufferError> {
        if data.len() != self.config.frame_size {
            return Err(BufferError::FrameSizeMismatch {
                expected: self.config.frame_size,
                actual: data.len(),
            });
        }

        let (sequence, dropped_oldest) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BufferError::Closed);
            }

            let mut dropped_oldest = false;
            if state.count == self.config.depth {
                match self.config.policy {
                    OverwritePolicy::DropOldest => {
                        let discarded = state.sequences[state.head];
                        state.head = (state.head + 1) % self.config.depth;
                        state.count -= 1;
                        dropped_oldest = true;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(sequence = discarded, "Dropped oldest unread frame");
                    }
                    OverwritePolicy::BlockProducer => {
                        while state.count == self.config.depth && !state.closed {
                            trace!("Ring buffer full, producer waiting");
                            self.not_full.wait(&mut state);
                        }
                        if state.closed {
                            return Err(BufferError::Closed);
                        }
                    }
                }
            }

            let slot = (state.head + state.count) % self.config.depth;
            let offset = slot * self.config.frame_size;
            state.storage[offset..offset + self.config.frame_size].copy_from_slice(data);

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.sequences[slot] = sequence;
            state.count += 1;
            (sequence, dropped_oldest)
        };

        self.written.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();

        // Clone out so the callback runs without holding any buffer lock.
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(FrameWritten {
                sequence,
                data,
                dropped_oldest,
            });
        }

        Ok(sequence)
    }

    /// Pop the oldest unread frame into `out`, returning its sequence number.
    ///
    /// Fails with [`BufferError::Empty`] when nothing is unread.
    pub fn read_frame(&self, out: &mut [u8]) -> Result<u64, BufferError> {
        if out.len() != self.config.frame_size {
            return Err(BufferError::FrameSizeMismatch {
                expected: self.config.frame_size,
                actual: out.len(),
            });
        }
        let mut state = self.state.lock();
        if state.count == 0 {
            return Err(if state.closed {
                BufferError::Closed
            } else {
                BufferError::Empty
            });
        }
        let sequence = self.pop_locked(&mut state, out);
        drop(state);
        self.not_full.notify_one();
        Ok(sequence)
    }

    /// Pop the oldest unread frame, waiting up to `timeout` for one to arrive.
    ///
    /// The deadline is fixed on entry; wakeups that find the buffer still
    /// empty only wait out what is left of it.
    pub fn read_frame_timeout(&self, out: &mut [u8], timeout: Duration) -> Result<u64, BufferError> {
        if out.len() != self.config.frame_size {
            return Err(BufferError::FrameSizeMismatch {
                expected: self.config.frame_size,
                actual: out.len(),
            });
        }
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.count == 0 {
            if state.closed {
                return Err(BufferError::Closed);
            }
            let timed_out = match deadline {
                Some(deadline) => self.not_empty.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.not_empty.wait(&mut state);
                    false
                }
            };
            if timed_out && state.count == 0 {
                return Err(if state.closed {
                    BufferError::Closed
                } else {
                    BufferError::Timeout
                });
            }
        }
        let sequence = self.pop_locked(&mut state, out);
        drop(state);
        self.not_full.notify_one();
        Ok(sequence)
    }

    /// Pop the oldest unread frame into a freshly allocated copy.
    pub fn read_frame_owned(&self) -> Result<CapturedFrame, BufferError> {
        let mut data = vec![0u8; self.config.frame_size];
        let sequence = self.read_frame(&mut data)?;
        Ok(CapturedFrame { sequence, data })
    }

    fn pop_locked(&self, state: &mut SlotState, out: &mut [u8]) -> u64 {
        let slot = state.head;
        let offset = slot * self.config.frame_size;
        out.copy_from_slice(&state.storage[offset..offset + self.config.frame_size]);
        let sequence = state.sequences[slot];
        state.head = (state.head + 1) % self.config.depth;
        state.count -= 1;
        self.read.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// Whether no unread frame is held.
    pub fn is_empty(&self) -> bool {
        self.state.lock().count == 0
    }

    /// Whether every slot holds an unread frame.
    pub fn is_full(&self) -> bool {
        self.state.lock().count == self.config.depth
    }

    /// Number of unread frames.
    pub fn available_frame_count(&self) -> usize {
        self.state.lock().count
    }

    /// Lifetime counters.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.written.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the buffer: blocked writers and waiting readers wake up with
    /// [`BufferError::Closed`]. Unread frames can still be drained with
    /// [`read_frame`](Self::read_frame).
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
        info!("Frame ring buffer closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn buffer(depth: usize, frame_size: usize, policy: OverwritePolicy) -> FrameRingBuffer {
        FrameRingBuffer::new(RingBufferConfig {
            depth,
            frame_size,
            policy,
        })
        .unwrap()
    }

    #[test]
    fn test_timeout_survives_wakeups_without_frames() {
        let rb = buffer(2, 4, OverwritePolicy::DropOldest);
        let stop = AtomicBool::new(false);
        let mut out = [0u8; 4];

        let (result, waited) = thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    rb.not_empty.notify_all();
                    thread::sleep(Duration::from_millis(5));
                }
            });
            let started = Instant::now();
            let result = rb.read_frame_timeout(&mut out, Duration::from_millis(100));
            let waited = started.elapsed();
            stop.store(true, Ordering::Relaxed);
            (result, waited)
        });

        assert_eq!(result, Err(BufferError::Timeout));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let zero_depth = FrameRingBuffer::new(RingBufferConfig {
            depth: 0,
            frame_size: 16,
            policy: OverwritePolicy::DropOldest,
        });
        assert!(matches!(zero_depth, Err(BufferError::InvalidConfiguration(_))));

        let zero_size = FrameRingBuffer::new(RingBufferConfig {
            depth: 4,
            frame_size: 0,
            policy: OverwritePolicy::DropOldest,
        });
        assert!(matches!(zero_size, Err(BufferError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_write_size_mismatch() {
        let rb = buffer(2, 8, OverwritePolicy::DropOldest);
        assert_eq!(
            rb.write_frame(&[0u8; 7]),
            Err(BufferError::FrameSizeMismatch {
                expected: 8,
                actual: 7
            })
        );
        assert!(rb.is_empty());
        assert_eq!(rb.stats().written, 0);
    }

    #[test]
    fn test_read_empty_fails() {
        let rb = buffer(2, 4, OverwritePolicy::DropOldest);
        assert_eq!(rb.read_frame_owned(), Err(BufferError::Empty));
    }

    #[test]
    fn test_occupancy() {
        let rb = buffer(2, 4, OverwritePolicy::DropOldest);
        assert!(rb.is_empty());
        assert!(!rb.is_full());
        rb.write_frame(&[1; 4]).unwrap();
        assert_eq!(rb.available_frame_count(), 1);
        rb.write_frame(&[2; 4]).unwrap();
        assert!(rb.is_full());
        rb.read_frame_owned().unwrap();
        assert_eq!(rb.available_frame_count(), 1);
    }

    #[test]
    fn test_sequences_increase_across_drops() {
        let rb = buffer(3, 4, OverwritePolicy::DropOldest);
        for i in 0..10u8 {
            rb.write_frame(&[i; 4]).unwrap();
        }
        let first = rb.read_frame_owned().unwrap();
        let second = rb.read_frame_owned().unwrap();
        assert_eq!(first.sequence, 7);
        assert_eq!(second.sequence, 8);
        assert_eq!(first.data, vec![7; 4]);
        assert_eq!(rb.stats().dropped, 7);
    }

    #[test]
    fn test_depth_one_drop_oldest() {
        let rb = buffer(1, 2, OverwritePolicy::DropOldest);
        rb.write_frame(&[1, 1]).unwrap();
        rb.write_frame(&[2, 2]).unwrap();
        let frame = rb.read_frame_owned().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.data, vec![2, 2]);
        assert!(rb.is_empty());
    }

    #[test]
    fn test_callback_runs_outside_lock() {
        let rb = Arc::new(buffer(2, 4, OverwritePolicy::DropOldest));
        let seen = Arc::new(AtomicUsize::new(0));

        let observer = Arc::clone(&rb);
        let counter = Arc::clone(&seen);
        rb.set_frame_callback(move |event| {
            // Querying the buffer from the callback would deadlock if the
            // lock were still held.
            assert!(observer.available_frame_count() >= 1);
            assert_eq!(event.data.len(), 4);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rb.write_frame(&[0; 4]).unwrap();
        rb.write_frame(&[1; 4]).unwrap();
        rb.write_frame(&[2; 4]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        rb.clear_frame_callback();
        rb.write_frame(&[3; 4]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_close_wakes_blocked_writer() {
        let rb = Arc::new(buffer(1, 4, OverwritePolicy::BlockProducer));
        rb.write_frame(&[0; 4]).unwrap();

        let writer_rb = Arc::clone(&rb);
        let writer = thread::spawn(move || writer_rb.write_frame(&[1; 4]));

        thread::sleep(Duration::from_millis(50));
        rb.close();
        assert_eq!(writer.join().unwrap(), Err(BufferError::Closed));

        // Unread frame can still be drained after close.
        assert_eq!(rb.read_frame_owned().unwrap().sequence, 0);
        assert_eq!(rb.read_frame_owned(), Err(BufferError::Closed));
    }

    #[test]
    fn test_read_timeout() {
        let rb = buffer(2, 4, OverwritePolicy::DropOldest);
        let mut out = [0u8; 4];
        assert_eq!(
            rb.read_frame_timeout(&mut out, Duration::from_millis(10)),
            Err(BufferError::Timeout)
        );
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let rb = Arc::new(buffer(4, 64, OverwritePolicy::BlockProducer));
        let total = 500u64;

        let producer_rb = Arc::clone(&rb);
        let producer = thread::spawn(move || {
            for i in 0..total {
                let frame = [(i % 251) as u8; 64];
                producer_rb.write_frame(&frame).unwrap();
            }
        });

        let mut out = [0u8; 64];
        let mut expected = 0u64;
        while expected < total {
            let seq = rb
                .read_frame_timeout(&mut out, Duration::from_secs(5))
                .unwrap();
            assert_eq!(seq, expected);
            assert!(out.iter().all(|&b| b == (expected % 251) as u8));
            expected += 1;
        }

        producer.join().unwrap();
        assert_eq!(rb.stats().dropped, 0);
    }
}
