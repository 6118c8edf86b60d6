//! Frame transfer between the capture thread and the processing consumers.
pub mod ring_buffer;

pub use ring_buffer::{
    BufferError, BufferStats, CapturedFrame, FrameRingBuffer, FrameWritten, OverwritePolicy,
    RingBufferConfig,
};
