//! Frame reassembly: out-of-order results drained to the encoder in order.
//!
//! Workers finish frames in arbitrary order; the output video needs them in
//! ascending index order with no gaps. [`FrameBuffer`] holds out-of-order
//! frames in a map and drains consecutively from a `next_expected` cursor.
//! On finalize, gaps are filled with zero frames of the declared dimensions.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::FramecastResult;
use crate::media::Frame;

/// Sink that receives frames strictly in ascending index order.
///
/// Production uses the blocking video encoder behind this seam; tests use a
/// recording sink.
pub trait FrameSink {
    fn write(&mut self, frame: &Frame) -> FramecastResult<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Frame) -> FramecastResult<()>,
{
    fn write(&mut self, frame: &Frame) -> FramecastResult<()> {
        self(frame)
    }
}

struct BufferInner<S> {
    sink: S,
    pending: HashMap<u64, Frame>,
    next_expected: u64,
    written: u64,
    /// Sink failures counted and skipped; the cursor still advances so
    /// ordering never breaks over one bad write.
    write_failures: u64,
    /// Dimensions used for synthesized gap frames.
    width: u32,
    height: u32,
}

/// Indexed insertion, in-order drain.
///
/// Invariant: the sink sees indices `0, 1, …, N-1` exactly once, ascending.
/// Concurrent `add` calls serialize on an internal mutex; `flush_remaining`
/// is idempotent once the declared total has been reached.
pub struct FrameBuffer<S: FrameSink> {
    inner: Mutex<BufferInner<S>>,
}

impl<S: FrameSink> FrameBuffer<S> {
    /// `width`/`height` are the declared output dimensions, used when a
    /// missing frame must be synthesized at finalize time.
    pub fn new(sink: S, width: u32, height: u32) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                sink,
                pending: HashMap::new(),
                next_expected: 0,
                written: 0,
                write_failures: 0,
                width,
                height,
            }),
        }
    }

    /// Inserts a frame, then drains every consecutive frame starting at
    /// `next_expected`. Returns how many frames were written by this call.
    pub fn add(&self, index: u64, frame: Frame) -> u64 {
        let mut inner = self.inner.lock();
        if index < inner.next_expected {
            log::warn!(
                "[Assemble] Dropping duplicate frame {} (cursor at {})",
                index,
                inner.next_expected
            );
            return 0;
        }
        inner.pending.insert(index, frame);

        let mut written = 0;
        while let Some(frame) = {
            let key = inner.next_expected;
            inner.pending.remove(&key)
        } {
            inner.write_one(&frame);
            written += 1;
        }
        written
    }

    /// Writes every remaining index up to `total`, synthesizing a zero frame
    /// for each gap. Idempotent: a second call finds the cursor already at
    /// `total` and writes nothing.
    pub fn flush_remaining(&self, total: u64) -> u64 {
        let mut inner = self.inner.lock();
        let mut written = 0;
        while inner.next_expected < total {
            let key = inner.next_expected;
            let frame = match inner.pending.remove(&key) {
                Some(frame) => frame,
                None => {
                    log::warn!("[Assemble] Missing frame {}, filling with zero frame", key);
                    Frame::zero(inner.width, inner.height)
                }
            };
            inner.write_one(&frame);
            written += 1;
        }
        inner.pending.clear();
        written
    }

    /// Frames written to the sink so far.
    pub fn written(&self) -> u64 {
        self.inner.lock().written
    }

    /// Sink write failures so far (the cursor advanced past each).
    pub fn write_failures(&self) -> u64 {
        self.inner.lock().write_failures
    }

    /// Frames buffered out of order, not yet written.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Consumes the buffer and returns the sink.
    pub fn into_sink(self) -> S {
        self.inner.into_inner().sink
    }
}

impl<S: FrameSink> BufferInner<S> {
    fn write_one(&mut self, frame: &Frame) {
        match self.sink.write(frame) {
            Ok(()) => {}
            Err(e) => {
                // One bad write must not abort the session or stall the
                // cursor; the frame is recorded as failed upstream.
                log::error!(
                    "[Assemble] Sink write failed for frame {}: {}",
                    self.next_expected,
                    e
                );
                self.write_failures += 1;
            }
        }
        self.next_expected += 1;
        self.written += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramecastError;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Sink that records the order frames arrive in.
    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<StdMutex<Vec<Frame>>>,
    }

    impl FrameSink for RecordingSink {
        fn write(&mut self, frame: &Frame) -> FramecastResult<()> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn marked_frame(mark: u8) -> Frame {
        Frame {
            width: 2,
            height: 2,
            data: vec![mark; 12],
        }
    }

    #[test]
    fn in_order_frames_write_immediately() {
        let sink = RecordingSink::default();
        let buffer = FrameBuffer::new(sink.clone(), 2, 2);

        assert_eq!(buffer.add(0, marked_frame(0)), 1);
        assert_eq!(buffer.add(1, marked_frame(1)), 1);
        assert_eq!(buffer.written(), 2);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn out_of_order_frames_drain_in_order() {
        let sink = RecordingSink::default();
        let buffer = FrameBuffer::new(sink.clone(), 2, 2);

        assert_eq!(buffer.add(2, marked_frame(2)), 0);
        assert_eq!(buffer.add(1, marked_frame(1)), 0);
        assert_eq!(buffer.pending(), 2);
        // Frame 0 unblocks all three.
        assert_eq!(buffer.add(0, marked_frame(0)), 3);

        let frames = sink.frames.lock().unwrap();
        let marks: Vec<u8> = frames.iter().map(|f| f.data[0]).collect();
        assert_eq!(marks, vec![0, 1, 2]);
    }

    #[test]
    fn flush_fills_gaps_with_zero_frames() {
        let sink = RecordingSink::default();
        let buffer = FrameBuffer::new(sink.clone(), 2, 2);

        buffer.add(0, marked_frame(7));
        buffer.add(2, marked_frame(9));
        // Index 1 never arrives.
        assert_eq!(buffer.flush_remaining(4), 3);
        assert_eq!(buffer.written(), 4);

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].data[0], 7);
        assert!(frames[1].is_zero());
        assert_eq!(frames[2].data[0], 9);
        assert!(frames[3].is_zero());
    }

    #[test]
    fn flush_remaining_is_idempotent() {
        let sink = RecordingSink::default();
        let buffer = FrameBuffer::new(sink.clone(), 2, 2);

        buffer.add(0, marked_frame(1));
        assert_eq!(buffer.flush_remaining(3), 2);
        assert_eq!(buffer.flush_remaining(3), 0);
        assert_eq!(buffer.written(), 3);
        assert_eq!(sink.frames.lock().unwrap().len(), 3);
    }

    #[test]
    fn duplicate_and_stale_indices_are_dropped() {
        let sink = RecordingSink::default();
        let buffer = FrameBuffer::new(sink.clone(), 2, 2);

        buffer.add(0, marked_frame(1));
        assert_eq!(buffer.add(0, marked_frame(2)), 0);
        assert_eq!(buffer.written(), 1);
        assert_eq!(sink.frames.lock().unwrap()[0].data[0], 1);
    }

    #[test]
    fn failed_write_advances_cursor() {
        struct FlakySink {
            calls: u64,
        }
        impl FrameSink for FlakySink {
            fn write(&mut self, _frame: &Frame) -> FramecastResult<()> {
                self.calls += 1;
                if self.calls == 2 {
                    Err(FramecastError::MediaEncode("disk full".into()))
                } else {
                    Ok(())
                }
            }
        }

        let buffer = FrameBuffer::new(FlakySink { calls: 0 }, 2, 2);
        buffer.add(0, marked_frame(0));
        buffer.add(1, marked_frame(1));
        buffer.add(2, marked_frame(2));

        // The bad write on frame 1 is counted but does not stall frame 2.
        assert_eq!(buffer.written(), 3);
        assert_eq!(buffer.write_failures(), 1);
    }

    #[test]
    fn every_index_written_exactly_once() {
        let sink = RecordingSink::default();
        let buffer = FrameBuffer::new(sink.clone(), 2, 2);

        // Scrambled arrival order.
        for index in [4u64, 0, 3, 1, 2] {
            buffer.add(index, marked_frame(index as u8));
        }
        buffer.flush_remaining(5);

        let frames = sink.frames.lock().unwrap();
        let marks: Vec<u8> = frames.iter().map(|f| f.data[0]).collect();
        assert_eq!(marks, vec![0, 1, 2, 3, 4]);
    }
}
