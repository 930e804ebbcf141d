//! Frame accumulator for bridging variable-size pipeline buffers to the
//! fixed 10ms frames the engine requires.
//!
//! Buffers arriving from the pipeline rarely line up with frame boundaries.
//! The accumulator carries the tail of each buffer over to the next call and
//! completes it there.
//!
//! The completed frame is assembled from two buffers, but only the part that
//! came from the current buffer can be written back: the carried-over prefix
//! was handed back to the caller unprocessed on the previous call. That costs
//! up to one frame (~10ms) of unprocessed audio at each buffer boundary. It is
//! accepted as-is until a consumer needs exact per-chunk fidelity.

/// Reshapes arbitrary-length chunks into complete frames of `frame_size`
/// samples, carrying partial frames across calls.
pub struct FrameAccumulator {
    frame_size: usize,
    leftover: Vec<i16>,
    scratch: Vec<i16>,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            leftover: Vec::with_capacity(frame_size),
            scratch: vec![0; frame_size],
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples held back for the next call. Always less than `frame_size`.
    pub fn leftover_len(&self) -> usize {
        self.leftover.len()
    }

    /// Drops any carried-over samples.
    pub fn reset(&mut self) {
        self.leftover.clear();
    }

    /// Runs `process` on every complete frame, in order, modifying `chunk`
    /// in place. Returns the number of frames emitted.
    ///
    /// Samples that do not fill a frame stay in `chunk` unprocessed and are
    /// kept for the next call.
    pub fn accumulate<F>(&mut self, chunk: &mut [i16], mut process: F) -> usize
    where
        F: FnMut(&mut [i16]),
    {
        if chunk.is_empty() {
            return 0;
        }

        let n = self.frame_size;
        let mut emitted = 0;
        let mut pos = 0;

        if !self.leftover.is_empty() {
            let held = self.leftover.len();
            let needed = n - held;
            if chunk.len() < needed {
                self.leftover.extend_from_slice(chunk);
                return 0;
            }

            self.scratch[..held].copy_from_slice(&self.leftover);
            self.scratch[held..].copy_from_slice(&chunk[..needed]);
            process(&mut self.scratch);
            chunk[..needed].copy_from_slice(&self.scratch[held..]);

            self.leftover.clear();
            pos = needed;
            emitted += 1;
        }

        let mut frames = chunk[pos..].chunks_exact_mut(n);
        for frame in &mut frames {
            process(frame);
            emitted += 1;
        }
        self.leftover.extend_from_slice(frames.into_remainder());

        emitted
    }

    /// Read-only variant of [`accumulate`](Self::accumulate) for streams
    /// whose frames are consumed but never written back (the reverse path).
    pub fn feed<F>(&mut self, chunk: &[i16], mut process: F) -> usize
    where
        F: FnMut(&[i16]),
    {
        if chunk.is_empty() {
            return 0;
        }

        let n = self.frame_size;
        let mut emitted = 0;
        let mut rest = chunk;

        if !self.leftover.is_empty() {
            let needed = n - self.leftover.len();
            if rest.len() < needed {
                self.leftover.extend_from_slice(rest);
                return 0;
            }
            self.leftover.extend_from_slice(&rest[..needed]);
            process(&self.leftover);
            self.leftover.clear();
            rest = &rest[needed..];
            emitted += 1;
        }

        let frames = rest.chunks_exact(n);
        let remainder = frames.remainder();
        for frame in frames {
            process(frame);
            emitted += 1;
        }
        self.leftover.extend_from_slice(remainder);

        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const N: usize = 480;

    fn ramp(start: i16, len: usize) -> Vec<i16> {
        (0..len).map(|i| start.wrapping_add(i as i16)).collect()
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut acc = FrameAccumulator::new(N);
        let mut chunk: [i16; 0] = [];
        assert_eq!(acc.accumulate(&mut chunk, |_| panic!("no frame expected")), 0);
        assert_eq!(acc.leftover_len(), 0);
    }

    #[test]
    fn test_700_then_260_samples() {
        let mut acc = FrameAccumulator::new(N);
        let mut first = ramp(0, 700);
        let mut frames: Vec<Vec<i16>> = Vec::new();

        let emitted = acc.accumulate(&mut first, |f| frames.push(f.to_vec()));
        assert_eq!(emitted, 1);
        assert_eq!(frames[0], ramp(0, 480));
        assert_eq!(acc.leftover_len(), 220);

        let mut second = ramp(700, 260);
        let emitted = acc.accumulate(&mut second, |f| frames.push(f.to_vec()));
        assert_eq!(emitted, 1);
        assert_eq!(frames[1], ramp(480, 480));
        assert_eq!(acc.leftover_len(), 0);
    }

    #[test]
    fn test_completed_frame_writes_back_only_current_part() {
        let mut acc = FrameAccumulator::new(4);
        let mut first = [1, 1, 1];
        acc.accumulate(&mut first, |f| f.fill(9));
        // Too short for a frame: returned untouched.
        assert_eq!(first, [1, 1, 1]);

        let mut second = [2, 2, 2, 2, 2];
        let emitted = acc.accumulate(&mut second, |f| f.fill(9));
        assert_eq!(emitted, 2);
        assert_eq!(second, [9, 9, 9, 9, 9]);
        // The carried-over samples of `first` are not corrected.
        assert_eq!(first, [1, 1, 1]);
        assert_eq!(acc.leftover_len(), 0);
    }

    #[test]
    fn test_short_chunks_never_fill_leftover() {
        let mut acc = FrameAccumulator::new(N);
        let mut frames = 0;
        for _ in 0..1000 {
            let mut chunk = [0i16; 7];
            frames += acc.accumulate(&mut chunk, |_| {});
            assert!(acc.leftover_len() < N);
        }
        assert_eq!(frames, 7000 / N);
    }

    #[test]
    fn test_feed_matches_accumulate() {
        let mut a = FrameAccumulator::new(N);
        let mut b = FrameAccumulator::new(N);
        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for (i, len) in [100usize, 500, 900, 13, 447].iter().enumerate() {
            let data = ramp(i as i16 * 1000, *len);
            let mut copy = data.clone();
            a.accumulate(&mut copy, |f| seen_a.extend_from_slice(f));
            b.feed(&data, |f| seen_b.extend_from_slice(f));
        }
        assert_eq!(seen_a, seen_b);
        assert_eq!(a.leftover_len(), b.leftover_len());
    }

    #[test]
    fn test_reset_drops_leftover() {
        let mut acc = FrameAccumulator::new(N);
        let mut chunk = [0i16; 100];
        acc.accumulate(&mut chunk, |_| {});
        assert_eq!(acc.leftover_len(), 100);
        acc.reset();
        assert_eq!(acc.leftover_len(), 0);
    }

    proptest! {
        #[test]
        fn prop_chunking_is_associative(
            frames in 1usize..8,
            cuts in prop::collection::vec(0usize..4000, 0..12),
        ) {
            let total = frames * N;
            let signal = ramp(0, total);

            let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c % (total + 1)).collect();
            bounds.push(0);
            bounds.push(total);
            bounds.sort_unstable();

            let mut acc = FrameAccumulator::new(N);
            let mut seen: Vec<Vec<i16>> = Vec::new();
            for window in bounds.windows(2) {
                let mut chunk = signal[window[0]..window[1]].to_vec();
                acc.accumulate(&mut chunk, |f| seen.push(f.to_vec()));
            }

            prop_assert_eq!(seen.len(), frames);
            for (i, frame) in seen.iter().enumerate() {
                prop_assert_eq!(&frame[..], &signal[i * N..(i + 1) * N]);
            }
            prop_assert_eq!(acc.leftover_len(), 0);
        }
    }
}
