//! Audio buffers for the processing graph.
//!
//! Defines the multi-channel sample buffer passed through every node.

/// A multi-channel buffer of audio samples.
///
/// Storage for every channel is allocated up front for `capacity` frames.
/// The active length can then be changed with [`set_len`](Self::set_len)
/// without touching the allocator, which keeps the buffer usable on the
/// audio thread.
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    /// One sample vector per channel, each `capacity` long.
    channels: Vec<Vec<f32>>,
    /// Number of valid frames (at most `capacity`).
    len: usize,
    /// Frame capacity, kept separately so a buffer without channels still
    /// carries the block geometry.
    capacity: usize,
}

impl AudioBuffer {
    /// Creates a zeroed buffer with the given channel count and frame capacity.
    ///
    /// The active length starts at `capacity`.
    pub fn new(num_channels: usize, capacity: usize) -> Self {
        Self {
            channels: vec![vec![0.0; capacity]; num_channels],
            len: capacity,
            capacity,
        }
    }

    /// Creates a buffer from per-channel sample data.
    ///
    /// All channels are truncated to the shortest one.
    pub fn from_channels(channels: Vec<Vec<f32>>) -> Self {
        let len = channels.iter().map(Vec::len).min().unwrap_or(0);
        Self {
            channels,
            len,
            capacity: len,
        }
    }

    /// Returns the number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Returns the number of active frames.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer has no active frames.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the maximum number of frames this buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets the number of active frames, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Returns the active samples of a channel.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is out of range.
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel][..self.len]
    }

    /// Returns the active samples of a channel for writing.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is out of range.
    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        let len = self.len;
        &mut self.channels[channel][..len]
    }

    /// Zeroes every channel over the active length.
    pub fn clear(&mut self) {
        let len = self.len;
        for channel in &mut self.channels {
            channel[..len].fill(0.0);
        }
    }

    /// Zeroes every channel from `first` onwards.
    pub fn clear_from(&mut self, first: usize) {
        let len = self.len;
        for channel in self.channels.iter_mut().skip(first) {
            channel[..len].fill(0.0);
        }
    }

    /// Adds one channel of `source` into one channel of this buffer.
    ///
    /// Only the overlapping frames are summed. Out-of-range channels are ignored.
    pub fn add_from(&mut self, dest_channel: usize, source: &AudioBuffer, source_channel: usize) {
        if dest_channel >= self.num_channels() || source_channel >= source.num_channels() {
            return;
        }
        let frames = self.len.min(source.len);
        let src = &source.channels[source_channel][..frames];
        let dst = &mut self.channels[dest_channel][..frames];
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    }

    /// Copies one channel of `source` into one channel of this buffer.
    pub fn copy_from(&mut self, dest_channel: usize, source: &AudioBuffer, source_channel: usize) {
        if dest_channel >= self.num_channels() || source_channel >= source.num_channels() {
            return;
        }
        let frames = self.len.min(source.len);
        self.channels[dest_channel][..frames]
            .copy_from_slice(&source.channels[source_channel][..frames]);
    }

    /// Copies a frame range of `source` into this buffer starting at frame 0.
    ///
    /// Used to carve sub-blocks out of an oversized host buffer.
    pub fn copy_range_from(&mut self, source: &AudioBuffer, start: usize, frames: usize) {
        let frames = frames.min(self.capacity());
        self.len = frames;
        for (ch, dst) in self.channels.iter_mut().enumerate() {
            match source.channels.get(ch) {
                Some(src) => dst[..frames].copy_from_slice(&src[start..start + frames]),
                None => dst[..frames].fill(0.0),
            }
        }
    }

    /// Writes the active frames of this buffer back into `dest` at `start`.
    pub fn write_range_into(&self, dest: &mut AudioBuffer, start: usize) {
        let frames = self.len;
        for (ch, dst) in dest.channels.iter_mut().enumerate() {
            match self.channels.get(ch) {
                Some(src) => dst[start..start + frames].copy_from_slice(&src[..frames]),
                None => dst[start..start + frames].fill(0.0),
            }
        }
    }

    /// Returns the absolute peak of a channel over the active length.
    pub fn peak(&self, channel: usize) -> f32 {
        self.channels
            .get(channel)
            .map(|c| c[..self.len].iter().fold(0.0_f32, |acc, s| acc.max(s.abs())))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_creation() {
        let buffer = AudioBuffer::new(2, 256);
        assert_eq!(buffer.num_channels(), 2);
        assert_eq!(buffer.len(), 256);
        assert_eq!(buffer.capacity(), 256);
        assert!(buffer.channel(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_set_len_clamps_to_capacity() {
        let mut buffer = AudioBuffer::new(1, 64);
        buffer.set_len(32);
        assert_eq!(buffer.len(), 32);
        assert_eq!(buffer.channel(0).len(), 32);

        buffer.set_len(1000);
        assert_eq!(buffer.len(), 64);
    }

    #[test]
    fn test_channelless_buffer_keeps_capacity() {
        let mut buffer = AudioBuffer::new(0, 128);
        assert_eq!(buffer.num_channels(), 0);
        assert_eq!(buffer.capacity(), 128);
        buffer.set_len(64);
        assert_eq!(buffer.len(), 64);
        buffer.clear();
    }

    #[test]
    fn test_add_from_accumulates() {
        let mut dest = AudioBuffer::new(2, 4);
        let source = AudioBuffer::from_channels(vec![vec![0.25; 4], vec![0.5; 4]]);

        dest.add_from(0, &source, 1);
        dest.add_from(0, &source, 1);

        assert_eq!(dest.channel(0), &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(dest.channel(1), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_add_from_ignores_bad_channels() {
        let mut dest = AudioBuffer::new(1, 4);
        let source = AudioBuffer::new(1, 4);
        dest.add_from(3, &source, 0);
        dest.add_from(0, &source, 3);
        assert!(dest.channel(0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_sub_block_round_trip() {
        let host = AudioBuffer::from_channels(vec![(0..8).map(|i| i as f32).collect()]);
        let mut block = AudioBuffer::new(1, 4);
        block.copy_range_from(&host, 4, 4);
        assert_eq!(block.channel(0), &[4.0, 5.0, 6.0, 7.0]);

        let mut out = AudioBuffer::new(1, 8);
        block.write_range_into(&mut out, 4);
        assert_eq!(out.channel(0)[4..], [4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_peak() {
        let buffer = AudioBuffer::from_channels(vec![vec![0.1, -0.8, 0.3]]);
        assert!((buffer.peak(0) - 0.8).abs() < f32::EPSILON);
        assert_eq!(buffer.peak(5), 0.0);
    }
}
