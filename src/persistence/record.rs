//! Tagged rows produced by pollers.

use chrono::{DateTime, Local, NaiveDateTime, SubsecRound};
use serde::Serialize;
use std::fmt;

/// Target table of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RecordKind {
    /// `LS_DATA`.
    Daq,
    /// `RADON_DATA`.
    Radon,
    /// `MAGNETOMETER_DATA`.
    Magnetometer,
    /// `TH_O2_DATA`.
    ThO2,
    /// `UPS_DATA`.
    Ups,
    /// `FIRE_DATA`.
    Fire,
    /// `VOC_DATA`.
    Voc,
    /// `HV_DATA`.
    Hv,
    /// `PDU_DATA`.
    Pdu,
}

impl RecordKind {
    /// Every kind, in table order.
    pub const ALL: [RecordKind; 9] = [
        RecordKind::Daq,
        RecordKind::Radon,
        RecordKind::Magnetometer,
        RecordKind::ThO2,
        RecordKind::Ups,
        RecordKind::Fire,
        RecordKind::Voc,
        RecordKind::Hv,
        RecordKind::Pdu,
    ];

    /// Name of the backing table.
    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Daq => "LS_DATA",
            RecordKind::Radon => "RADON_DATA",
            RecordKind::Magnetometer => "MAGNETOMETER_DATA",
            RecordKind::ThO2 => "TH_O2_DATA",
            RecordKind::Ups => "UPS_DATA",
            RecordKind::Fire => "FIRE_DATA",
            RecordKind::Voc => "VOC_DATA",
            RecordKind::Hv => "HV_DATA",
            RecordKind::Pdu => "PDU_DATA",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// One bound column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlValue {
    /// SQL `NULL`, used for non-finite floats.
    Null,
    /// Boolean column.
    Bool(bool),
    /// Integer column.
    Int(i64),
    /// Floating-point column.
    Float(f64),
    /// String column.
    Text(String),
    /// Local date and time column.
    Timestamp(NaiveDateTime),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<u16> for SqlValue {
    fn from(value: u16) -> Self {
        SqlValue::Int(i64::from(value))
    }
}

/// NaN and infinities are stored as NULL.
impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            SqlValue::Float(value)
        } else {
            SqlValue::Null
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        SqlValue::Timestamp(value)
    }
}

/// Column values in table order.
pub type Row = Vec<SqlValue>;

/// Single row or a list of rows sharing one queue push.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    /// One row.
    Single(Row),
    /// Rows in insertion order.
    Batch(Vec<Row>),
}

/// One entry of the persistence queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceItem {
    /// Destination table.
    pub kind: RecordKind,
    /// Row or rows to insert.
    pub payload: Payload,
}

impl PersistenceItem {
    /// Item holding one row.
    pub fn single(kind: RecordKind, row: Row) -> Self {
        Self {
            kind,
            payload: Payload::Single(row),
        }
    }

    /// Item holding several rows of one kind.
    pub fn batch(kind: RecordKind, rows: Vec<Row>) -> Self {
        Self {
            kind,
            payload: Payload::Batch(rows),
        }
    }

    /// Rows carried by this item.
    pub fn row_count(&self) -> usize {
        match &self.payload {
            Payload::Single(_) => 1,
            Payload::Batch(rows) => rows.len(),
        }
    }

    /// Flatten into rows.
    pub fn into_rows(self) -> Vec<Row> {
        match self.payload {
            Payload::Single(row) => vec![row],
            Payload::Batch(rows) => rows,
        }
    }
}

/// Round to `decimals` places; NaN stays NaN.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Local wall-clock time truncated to whole seconds, for `DATETIME` keys.
pub fn second_timestamp(at: DateTime<Local>) -> NaiveDateTime {
    at.naive_local().trunc_subsecs(0)
}

/// Local wall-clock time truncated to milliseconds, for `DATETIME(3)` columns.
pub fn millisecond_timestamp(at: DateTime<Local>) -> NaiveDateTime {
    at.naive_local().trunc_subsecs(3)
}
