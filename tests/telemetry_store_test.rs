//! Integration tests for the telemetry store: retention, wraparound, gaps
//! and concurrent access.

use lab_monitor::telemetry::{ChannelSpec, Resolution, TelemetryStore};
use std::sync::Arc;
use std::thread;

fn single_channel(key: &str, columns: &[&str], days: u32) -> TelemetryStore {
    TelemetryStore::new(&[ChannelSpec::new(key, columns, Resolution::Fast)], days)
        .expect("Failed to build store")
}

#[test]
fn one_day_of_minutes_keeps_the_last_1440_samples() {
    let store = single_channel("MAG", &["Bx"], 1);

    for n in 1..=1500 {
        store
            .update_channel("MAG", f64::from(n) * 60.0, &[f64::from(n)])
            .unwrap();
    }

    let snapshot = store.snapshot("MAG").unwrap();
    assert_eq!(snapshot.data.len(), 1440);
    assert_eq!(snapshot.data.filled(), 1440);

    let bx = snapshot.column("Bx").unwrap();
    assert_eq!(bx[0], 61.0);
    assert_eq!(bx[1439], 1500.0);
    assert!(bx.windows(2).all(|w| w[1] - w[0] == 1.0));
    assert!(snapshot
        .data
        .timestamps
        .windows(2)
        .all(|w| w[0] < w[1]));
}

#[test]
fn capacity_plus_one_writes_wrap_once() {
    let specs = [ChannelSpec::new("RADON", &["mu", "sigma"], Resolution::Slow)];
    let store = TelemetryStore::new(&specs, 1).unwrap();
    let capacity = 144;

    for n in 0..=capacity {
        let v = n as f64;
        store.update_channel("RADON", v, &[v, v / 10.0]).unwrap();
    }

    let snapshot = store.snapshot("RADON").unwrap();
    assert_eq!(snapshot.data.len(), capacity);
    let newest = capacity as f64;
    let matching = snapshot
        .data
        .timestamps
        .iter()
        .filter(|&&t| t == newest)
        .count();
    assert_eq!(matching, 1);
    assert_eq!(snapshot.data.timestamps[capacity - 1], newest);
    assert_eq!(snapshot.data.timestamps[0], 1.0);
}

#[test]
fn missed_cycle_leaves_a_nan_row() {
    let store = single_channel("UPS", &["LINEV", "BCHARGE", "TIMELEFT"], 1);
    store.update_channel("UPS", 60.0, &[230.0, 100.0, 45.0]).unwrap();
    store.mark_gap("UPS").unwrap();
    store.update_channel("UPS", 180.0, &[229.0, 99.0, 44.0]).unwrap();

    let snapshot = store.snapshot("UPS").unwrap();
    let n = snapshot.data.len();
    let linev = snapshot.column("LINEV").unwrap();
    assert_eq!(linev[n - 1], 229.0);
    assert!(linev[n - 2].is_nan());
    assert!(snapshot.data.timestamps[n - 2].is_nan());
    assert_eq!(linev[n - 3], 230.0);
}

#[test]
fn unknown_channel_and_wrong_width_are_errors() {
    let store = single_channel("FIRE", &["status_code"], 1);
    assert!(store.update_channel("NOPE", 1.0, &[1.0]).is_err());
    assert!(store.update_channel("FIRE", 1.0, &[1.0, 2.0]).is_err());
    assert!(store.snapshot("NOPE").is_err());
}

/// Writers store rows whose values all equal the timestamp; any torn row
/// would show a mismatch.
#[test]
fn concurrent_writers_and_readers_never_see_torn_rows() {
    let specs = [
        ChannelSpec::new("A", &["x", "y", "z"], Resolution::Fast),
        ChannelSpec::new("B", &["x", "y", "z"], Resolution::Fast),
    ];
    let store = Arc::new(TelemetryStore::new(&specs, 1).unwrap());
    let mut handles = Vec::new();

    for key in ["A", "B"] {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for n in 0..5_000u32 {
                let v = f64::from(n);
                store.update_channel(key, v, &[v, v, v]).unwrap();
            }
        }));
    }

    for key in ["A", "B"] {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                let snapshot = store.snapshot(key).unwrap();
                for row in 0..snapshot.data.len() {
                    let values = snapshot.data.row(row).unwrap();
                    let t = values[0];
                    if t.is_nan() {
                        assert!(values.iter().all(|v| v.is_nan()));
                    } else {
                        assert!(values.iter().all(|&v| v == t), "torn row {values:?}");
                    }
                }
            }
        }));
    }

    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let a = store.snapshot("A").unwrap();
    assert_eq!(a.data.row(a.data.len() - 1).unwrap()[0], 4_999.0);
}
