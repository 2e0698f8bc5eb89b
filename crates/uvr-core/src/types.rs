use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use crate::errors::BufferOverflow;

// MARK: - TimeValue

/// Wall-clock timestamp carried in every envelope as two 32-bit fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TimeValue {
    pub sec: i32,
    pub usec: i32,
}

impl TimeValue {
    pub const ZERO: Self = Self { sec: 0, usec: 0 };

    pub fn new(sec: i32, usec: i32) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Seconds are truncated to 32 bits, matching the envelope field width.
    pub fn from_system_time(t: SystemTime) -> Self {
        let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since_epoch.as_secs() as i32,
            usec: since_epoch.subsec_micros() as i32,
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }
}

impl std::fmt::Display for TimeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

// MARK: - FrameBuffer

/// The single reusable buffer a sender or receiver context writes each frame
/// into. It is overwritten in place every cycle.
///
/// Every write is bounds-checked against `limit`. [`FrameBuffer::take`] hands
/// the bytes over as an owned [`CompletedFrame`]; once the consumer drops it
/// the allocation is reclaimed by the next write.
#[derive(Debug)]
pub struct FrameBuffer {
    data: BytesMut,
    timestamp: TimeValue,
    limit: usize,
}

impl FrameBuffer {
    /// Initial allocation; the buffer grows on demand up to `limit`.
    const INITIAL_CAPACITY: usize = 64 * 1024;

    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(limit.min(Self::INITIAL_CAPACITY)),
            timestamp: TimeValue::ZERO,
            limit,
        }
    }

    /// Number of valid bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn timestamp(&self) -> TimeValue {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: TimeValue) {
        self.timestamp = timestamp;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Drops the contents; `size()` becomes 0.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends `bytes` at the current end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferOverflow> {
        self.check(self.data.len(), bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes `bytes` at `offset`, which must not be past the current end.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), BufferOverflow> {
        self.check(offset, bytes.len())?;
        if offset > self.data.len() {
            return Err(BufferOverflow {
                offset,
                len: bytes.len(),
                limit: self.data.len(),
            });
        }
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Resizes to exactly `len` bytes and returns them for an in-place fill.
    pub fn fill(&mut self, len: usize) -> Result<&mut [u8], BufferOverflow> {
        self.check(0, len)?;
        self.data.resize(len, 0);
        Ok(&mut self.data[..])
    }

    /// Moves the current contents out, leaving the buffer empty.
    pub fn take(&mut self) -> CompletedFrame {
        CompletedFrame {
            data: self.data.split().freeze(),
            timestamp: self.timestamp,
        }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), BufferOverflow> {
        match offset.checked_add(len) {
            Some(end) if end <= self.limit => Ok(()),
            _ => Err(BufferOverflow {
                offset,
                len,
                limit: self.limit,
            }),
        }
    }
}

// MARK: - CompletedFrame

/// A fully reassembled frame, owned by whoever receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub data: Bytes,
    pub timestamp: TimeValue,
}

impl CompletedFrame {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

// MARK: - RunningAverage

/// Exponentially weighted average of a timing, in microseconds.
///
/// Each sample moves the average by [`RunningAverage::WEIGHT`]. It starts at
/// zero rather than at the first sample, so it settles after a few hundred
/// frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningAverage {
    micros: f64,
    samples: u64,
}

impl RunningAverage {
    pub const WEIGHT: f64 = 0.002;

    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in one sample and returns the new average.
    pub fn record_micros(&mut self, sample: f64) -> f64 {
        self.micros = (1.0 - Self::WEIGHT) * self.micros + Self::WEIGHT * sample;
        self.samples += 1;
        self.micros
    }

    pub fn record(&mut self, sample: Duration) -> f64 {
        self.record_micros(sample.as_secs_f64() * 1e6)
    }

    /// May be negative when the samples are clock differences.
    pub fn micros(&self) -> f64 {
        self.micros
    }

    /// The average as a duration, clamped at zero.
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.micros.max(0.0) / 1e6)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_respects_limit() {
        let mut buf = FrameBuffer::with_limit(8);
        buf.append(&[1, 2, 3, 4, 5]).unwrap();
        let err = buf.append(&[6, 7, 8, 9]).unwrap_err();
        assert_eq!(err, BufferOverflow { offset: 5, len: 4, limit: 8 });
        assert_eq!(buf.size(), 5);
    }

    #[test]
    fn write_at_rejects_gaps() {
        let mut buf = FrameBuffer::with_limit(16);
        buf.append(&[0; 4]).unwrap();
        assert!(buf.write_at(6, &[1]).is_err());
        buf.write_at(2, &[9, 9, 9, 9]).unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn take_transfers_contents_and_empties_buffer() {
        let mut buf = FrameBuffer::with_limit(16);
        buf.append(b"frame").unwrap();
        buf.set_timestamp(TimeValue::new(10, 20));

        let frame = buf.take();
        assert_eq!(&frame.data[..], b"frame");
        assert_eq!(frame.timestamp, TimeValue::new(10, 20));
        assert!(buf.is_empty());

        drop(frame);
        buf.append(b"next").unwrap();
        assert_eq!(buf.as_slice(), b"next");
    }

    #[test]
    fn fill_sizes_exactly() {
        let mut buf = FrameBuffer::with_limit(4);
        buf.fill(3).unwrap().copy_from_slice(b"abc");
        assert_eq!(buf.as_slice(), b"abc");
        assert!(buf.fill(5).is_err());
    }

    #[test]
    fn running_average_moves_two_per_mille_per_sample() {
        let mut avg = RunningAverage::new();
        assert!((avg.record_micros(1000.0) - 2.0).abs() < 1e-9);
        assert!((avg.record_micros(1000.0) - 3.996).abs() < 1e-9);
        assert_eq!(avg.samples(), 2);
    }

    #[test]
    fn running_average_settles_on_a_steady_input() {
        let mut avg = RunningAverage::new();
        for _ in 0..5000 {
            avg.record(Duration::from_millis(2));
        }
        assert!((avg.micros() - 2000.0).abs() < 1.0, "{}", avg.micros());
        let settled = avg.as_duration();
        assert!(settled > Duration::from_micros(1990) && settled <= Duration::from_micros(2000));
    }

    #[test]
    fn negative_average_reads_as_zero_duration() {
        let mut avg = RunningAverage::new();
        avg.record_micros(-500.0);
        assert!(avg.micros() < 0.0);
        assert_eq!(avg.as_duration(), Duration::ZERO);
    }

    #[test]
    fn time_value_micros() {
        assert_eq!(TimeValue::new(2, 500).as_micros(), 2_000_500);
        assert_eq!(TimeValue::new(1, 42).to_string(), "1.000042");
    }
}
