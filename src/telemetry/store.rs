//! Shared in-memory telemetry.
//!
//! One `std::sync::RwLock` guards every ring buffer and the latest-value
//! cache. Writers hold it for one row copy, readers for one array copy; no
//! I/O ever happens under the lock, so a plain blocking lock is fine from
//! async tasks and from blocking acquisition threads alike.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Local};

use crate::config::MonitorConfig;
use crate::error::{AppResult, MonitorError};
use crate::hardware::DeviceKind;
use crate::telemetry::channels::{catalog, hv_slot_key, ChannelSpec};
use crate::telemetry::reading::DeviceReading;
use crate::telemetry::ring_buffer::{RingBuffer, Snapshot};

/// Seconds since the Unix epoch with millisecond resolution.
pub fn epoch_seconds(at: DateTime<Local>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Latest decoded reading of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestEntry {
    /// Decoded value.
    pub reading: DeviceReading,
    /// Time the value was stored.
    pub updated_at: DateTime<Local>,
}

/// Chronological copy of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    /// Channel key.
    pub key: String,
    /// Value column names.
    pub columns: Vec<String>,
    /// Rows in chronological order.
    pub data: Snapshot,
}

impl SeriesSnapshot {
    /// Values of one named column.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.data.values.get(index).map(Vec::as_slice)
    }
}

struct ChannelBuffer {
    columns: Vec<String>,
    buffer: RingBuffer,
}

#[derive(Default)]
struct StoreInner {
    channels: HashMap<String, ChannelBuffer>,
    latest: HashMap<DeviceKind, LatestEntry>,
}

/// Ring buffers per channel plus the latest-value cache.
pub struct TelemetryStore {
    inner: RwLock<StoreInner>,
    retention_days: u32,
}

impl TelemetryStore {
    /// Allocate every buffer up front.
    pub fn new(specs: &[ChannelSpec], retention_days: u32) -> AppResult<Self> {
        let mut channels = HashMap::with_capacity(specs.len());
        for spec in specs {
            let buffer = RingBuffer::new(spec.capacity(retention_days), spec.columns.len())?;
            channels.insert(
                spec.key.clone(),
                ChannelBuffer {
                    columns: spec.columns.clone(),
                    buffer,
                },
            );
        }
        Ok(Self {
            inner: RwLock::new(StoreInner {
                channels,
                latest: HashMap::new(),
            }),
            retention_days,
        })
    }

    /// Store with every channel of the catalog.
    pub fn from_config(config: &MonitorConfig) -> AppResult<Self> {
        Self::new(&catalog(config), config.retention.days)
    }

    /// Days of history kept per channel.
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one row to a channel.
    pub fn update_channel(&self, key: &str, timestamp: f64, values: &[f64]) -> AppResult<()> {
        let mut inner = self.write();
        let channel = inner
            .channels
            .get_mut(key)
            .ok_or_else(|| MonitorError::UnknownChannel(key.to_string()))?;
        channel
            .buffer
            .push(timestamp, values)
            .map_err(|err| match err {
                MonitorError::ChannelWidth {
                    expected, actual, ..
                } => MonitorError::ChannelWidth {
                    key: key.to_string(),
                    expected,
                    actual,
                },
                other => other,
            })
    }

    /// Advance a channel without data so the stall shows as a break.
    pub fn mark_gap(&self, key: &str) -> AppResult<()> {
        let mut inner = self.write();
        let channel = inner
            .channels
            .get_mut(key)
            .ok_or_else(|| MonitorError::UnknownChannel(key.to_string()))?;
        channel.buffer.skip();
        Ok(())
    }

    /// Overwrite the cached reading of a device.
    pub fn update_latest(&self, device: DeviceKind, reading: DeviceReading) {
        self.write().latest.insert(
            device,
            LatestEntry {
                reading,
                updated_at: Local::now(),
            },
        );
    }

    /// Latest reading of `device`.
    pub fn latest(&self, device: DeviceKind) -> Option<DeviceReading> {
        self.read()
            .latest
            .get(&device)
            .map(|entry| entry.reading.clone())
    }

    /// Latest reading of `device` with its time.
    pub fn latest_entry(&self, device: DeviceKind) -> Option<LatestEntry> {
        self.read().latest.get(&device).cloned()
    }

    /// Chronological copy of channel `key`.
    pub fn snapshot(&self, key: &str) -> AppResult<SeriesSnapshot> {
        let inner = self.read();
        let channel = inner
            .channels
            .get(key)
            .ok_or_else(|| MonitorError::UnknownChannel(key.to_string()))?;
        Ok(SeriesSnapshot {
            key: key.to_string(),
            columns: channel.columns.clone(),
            data: channel.buffer.snapshot(),
        })
    }

    /// Configured channel keys, sorted.
    pub fn channel_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().channels.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy the cached HV readings into the per-board history buffers.
    ///
    /// `slots` lists `(slot, channel count)`. Channels missing from the cache
    /// are written as NaN. Returns the number of rows written.
    pub fn sample_cross_section(&self, slots: &[(u16, u16)], now: f64) -> usize {
        let mut inner = self.write();
        let snapshot = match inner.latest.get(&DeviceKind::CaenHv) {
            Some(LatestEntry {
                reading: DeviceReading::Hv(snapshot),
                ..
            }) => Some(snapshot.clone()),
            _ => None,
        };

        let mut written = 0;
        for &(slot, channels) in slots {
            let Some(channel) = inner.channels.get_mut(&hv_slot_key(slot)) else {
                continue;
            };
            let mut row = Vec::with_capacity(usize::from(channels) * 2);
            for ch in 0..channels {
                match snapshot.as_ref().and_then(|s| s.channel(slot, ch)) {
                    Some(reading) => {
                        row.push(reading.vmon);
                        row.push(reading.imon);
                    }
                    None => {
                        row.push(f64::NAN);
                        row.push(f64::NAN);
                    }
                }
            }
            if channel.buffer.push(now, &row).is_ok() {
                written += 1;
            }
        }
        written
    }
}
