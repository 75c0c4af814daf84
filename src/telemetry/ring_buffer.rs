//! Fixed-capacity time-series buffer.
//!
//! Rows are `[timestamp, value_1, ..., value_k]` stored in one pre-allocated
//! arena of `f64`. The arena holds `capacity + 1` rows: `capacity` rows of
//! history plus the slot under the write cursor. Every time the cursor
//! advances, the slot it lands on is filled with NaN before anything else
//! happens, so a producer that stops writing leaves a visible break between
//! the newest and the oldest row instead of a stale flat line.
//!
//! # Layout
//!
//! ```text
//!   oldest                      newest  cursor (NaN)
//!      v                           v      v
//!   [ row | row | row | ... | row | row | --- | row | ... ]
//! ```
//!
//! [`RingBuffer::snapshot`] walks the `capacity` rows after the cursor, which
//! is chronological order. Rows that were never written (or were skipped with
//! [`RingBuffer::skip`]) come back as NaN and must be treated as "no data".
//!
//! The buffer itself is not synchronized; `TelemetryStore` wraps every buffer
//! behind one reader/writer lock.

use crate::error::{AppResult, MonitorError};

/// Arena-backed circular buffer of timestamped rows.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    /// Values per row, excluding the timestamp.
    columns: usize,
    capacity: usize,
    slots: Vec<f64>,
    cursor: usize,
    advanced: u64,
}

/// Column-major copy of a buffer in chronological order.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Epoch seconds per row. NaN marks a skipped row.
    pub timestamps: Vec<f64>,
    /// `values[column][row]`
    pub values: Vec<Vec<f64>>,
}

impl Snapshot {
    /// Rows in the snapshot.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the snapshot has no rows.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Row `index` as `[timestamp, value_1, ..., value_k]`.
    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        let timestamp = *self.timestamps.get(index)?;
        let mut row = Vec::with_capacity(self.values.len() + 1);
        row.push(timestamp);
        for column in &self.values {
            row.push(*column.get(index)?);
        }
        Some(row)
    }

    /// Number of rows carrying a real timestamp.
    pub fn filled(&self) -> usize {
        self.timestamps.iter().filter(|t| !t.is_nan()).count()
    }
}

impl RingBuffer {
    /// Allocate a buffer holding `capacity` rows of `columns` values each.
    pub fn new(capacity: usize, columns: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(MonitorError::Configuration(
                "ring buffer capacity must be at least 1".to_string(),
            ));
        }
        let width = columns + 1;
        Ok(Self {
            columns,
            capacity,
            slots: vec![f64::NAN; (capacity + 1) * width],
            cursor: 0,
            advanced: 0,
        })
    }

    /// Rows the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Value columns per row, timestamp excluded.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Rows written or skipped since creation, capped at capacity.
    pub fn len(&self) -> usize {
        usize::try_from(self.advanced).map_or(self.capacity, |n| n.min(self.capacity))
    }

    /// Whether nothing was written or skipped yet.
    pub fn is_empty(&self) -> bool {
        self.advanced == 0
    }

    fn width(&self) -> usize {
        self.columns + 1
    }

    fn arena_rows(&self) -> usize {
        self.capacity + 1
    }

    /// Write one row at the cursor and advance.
    pub fn push(&mut self, timestamp: f64, values: &[f64]) -> AppResult<()> {
        if values.len() != self.columns {
            return Err(MonitorError::ChannelWidth {
                key: String::new(),
                expected: self.columns,
                actual: values.len(),
            });
        }
        let width = self.width();
        let start = self.cursor * width;
        let row = &mut self.slots[start..start + width];
        row[0] = timestamp;
        row[1..].copy_from_slice(values);
        self.advance();
        Ok(())
    }

    /// Advance without writing, leaving a NaN row behind.
    pub fn skip(&mut self) {
        self.advance();
    }

    fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.arena_rows();
        let width = self.width();
        let start = self.cursor * width;
        self.slots[start..start + width].fill(f64::NAN);
        self.advanced += 1;
    }

    /// Most recently written row, if the last advance was a write.
    pub fn latest(&self) -> Option<&[f64]> {
        if self.advanced == 0 {
            return None;
        }
        let width = self.width();
        let index = (self.cursor + self.arena_rows() - 1) % self.arena_rows();
        let row = &self.slots[index * width..(index + 1) * width];
        if row[0].is_nan() {
            None
        } else {
            Some(row)
        }
    }

    /// Copy of the history, oldest row first.
    pub fn snapshot(&self) -> Snapshot {
        let width = self.width();
        let rows = self.arena_rows();
        let mut timestamps = Vec::with_capacity(self.capacity);
        let mut values = vec![Vec::with_capacity(self.capacity); self.columns];
        for offset in 1..=self.capacity {
            let index = (self.cursor + offset) % rows;
            let row = &self.slots[index * width..(index + 1) * width];
            timestamps.push(row[0]);
            for (column, value) in values.iter_mut().zip(&row[1..]) {
                column.push(*value);
            }
        }
        Snapshot { timestamps, values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(RingBuffer::new(0, 2).is_err());
    }

    #[test]
    fn rejects_wrong_width() {
        let mut rb = RingBuffer::new(4, 2).unwrap();
        assert!(rb.push(1.0, &[1.0]).is_err());
        assert!(rb.is_empty());
    }

    #[test]
    fn fresh_buffer_is_all_nan() {
        let rb = RingBuffer::new(3, 1).unwrap();
        let snap = rb.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.filled(), 0);
        assert!(rb.latest().is_none());
    }

    #[test]
    fn partial_fill_keeps_order() {
        let mut rb = RingBuffer::new(5, 1).unwrap();
        rb.push(1.0, &[10.0]).unwrap();
        rb.push(2.0, &[20.0]).unwrap();
        let snap = rb.snapshot();
        // Unwritten rows lead, written rows trail in order.
        assert!(snap.timestamps[0].is_nan());
        assert_eq!(&snap.timestamps[3..], &[1.0, 2.0]);
        assert_eq!(&snap.values[0][3..], &[10.0, 20.0]);
        assert_eq!(rb.len(), 2);
    }

    #[test]
    fn wraparound_keeps_most_recent_once() {
        let n = 4;
        let mut rb = RingBuffer::new(n, 1).unwrap();
        for i in 0..=n {
            let t = i as f64;
            rb.push(t, &[t * 10.0]).unwrap();
        }
        let snap = rb.snapshot();
        assert_eq!(snap.len(), n);
        let newest = n as f64;
        assert_eq!(snap.timestamps.iter().filter(|t| **t == newest).count(), 1);
        assert_eq!(snap.timestamps, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(rb.latest(), Some(&[4.0, 40.0][..]));
    }

    #[test]
    fn skip_leaves_nan_row() {
        let mut rb = RingBuffer::new(4, 2).unwrap();
        rb.push(1.0, &[1.0, 1.0]).unwrap();
        rb.skip();
        rb.push(3.0, &[3.0, 3.0]).unwrap();
        let snap = rb.snapshot();
        // [never written, t=1, skipped, t=3]
        assert!(snap.timestamps[0].is_nan());
        assert_eq!(snap.timestamps[1], 1.0);
        assert!(snap.row(2).unwrap().iter().all(|v| v.is_nan()));
        assert_eq!(snap.row(3), Some(vec![3.0, 3.0, 3.0]));
        assert_eq!(rb.len(), 3);
    }

    #[test]
    fn latest_is_none_after_skip() {
        let mut rb = RingBuffer::new(3, 1).unwrap();
        rb.push(1.0, &[1.0]).unwrap();
        rb.skip();
        assert!(rb.latest().is_none());
    }
}
