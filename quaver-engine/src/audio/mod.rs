//! Audio pipeline: sample formats, byte buffering, and device output

pub mod device;
pub mod format;
pub mod out_buffer;
pub mod ring_buffer;

pub use device::{AudioSink, CaptureSink, CpalSink};
pub use format::{Endianness, SampleFormat, SoundParams};
pub use out_buffer::OutputBuffer;
pub use ring_buffer::RingBuffer;
