//! Short rolling window of raw samples, averaged for dashboards.

use std::time::Duration;

/// Collects raw rows until `target` samples are in, then yields column means.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    target: usize,
    samples: Vec<Vec<f64>>,
}

impl RollingWindow {
    /// Window of `target` samples, at least one.
    pub fn new(target: usize) -> Self {
        let target = target.max(1);
        Self {
            target,
            samples: Vec::with_capacity(target),
        }
    }

    /// Window sized to cover `window` at one sample per `interval`.
    pub fn covering(window: Duration, interval: Duration) -> Self {
        Self::new(target_for(window, interval))
    }

    /// Samples per window.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Samples collected so far.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample is collected.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add a sample. When the window is full, returns the per-column means
    /// and starts over.
    pub fn push(&mut self, values: &[f64]) -> Option<Vec<f64>> {
        self.samples.push(values.to_vec());
        if self.samples.len() < self.target {
            return None;
        }
        let width = self.samples.iter().map(Vec::len).max().unwrap_or(0);
        let means = (0..width)
            .map(|col| finite_mean(self.samples.iter().filter_map(|row| row.get(col).copied())))
            .collect();
        self.samples.clear();
        Some(means)
    }

    /// Drop the collected samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Mean of the finite values, NaN when there are none.
pub fn finite_mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Samples needed to cover `window` at one per `interval`, at least one.
pub fn target_for(window: Duration, interval: Duration) -> usize {
    if interval.is_zero() {
        return 1;
    }
    (window.as_secs_f64() / interval.as_secs_f64()).round().max(1.0) as usize
}
