//! Integration tests for the batch persistence writer against the in-memory
//! backend.

use chrono::{NaiveDate, NaiveDateTime};
use lab_monitor::persistence::{
    persistence_queue, BatchPersistenceWriter, MemoryBackend, PersistenceItem, PersistenceSender,
    RecordKind, SqlValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn at(second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 1)
        .and_then(|d| d.and_hms_opt(12, 0, second))
        .expect("valid timestamp")
}

fn radon(second: u32) -> PersistenceItem {
    PersistenceItem::single(
        RecordKind::Radon,
        vec![at(second).into(), 12.5.into(), 1.25.into()],
    )
}

fn th_o2(second: u32) -> PersistenceItem {
    PersistenceItem::single(
        RecordKind::ThO2,
        vec![at(second).into(), 22.5.into(), 45.0.into(), 20.9.into()],
    )
}

fn voc(second: u32) -> PersistenceItem {
    PersistenceItem::single(
        RecordKind::Voc,
        vec![at(second).into(), 0.25.into(), 0u16.into(), "ppm".into()],
    )
}

fn writer(backend: &MemoryBackend) -> (PersistenceSender, BatchPersistenceWriter) {
    let (tx, rx) = persistence_queue();
    let writer = BatchPersistenceWriter::with_intervals(
        Arc::new(backend.clone()),
        rx,
        Duration::from_secs(60),
        Duration::from_secs(10),
    );
    (tx, writer)
}

#[tokio::test]
async fn failing_middle_group_commits_nothing() {
    let backend = MemoryBackend::new();
    let (tx, mut writer) = writer(&backend);
    writer.ensure_schema().await.unwrap();
    backend.fail_inserts_into("TH_O2_DATA");

    for second in 0..3 {
        assert!(tx.push(radon(second)));
        assert!(tx.push(th_o2(second)));
        assert!(tx.push(voc(second)));
    }

    let err = writer.flush().await.unwrap_err();
    assert!(err.to_string().contains("TH_O2_DATA"));
    assert_eq!(backend.row_count("RADON_DATA"), 0);
    assert_eq!(backend.row_count("TH_O2_DATA"), 0);
    assert_eq!(backend.row_count("VOC_DATA"), 0);
    assert_eq!(backend.commits(), 0);
    assert_eq!(backend.rollbacks(), 1);

    // The failed batch is gone; only new items are written next time.
    backend.clear_failures();
    assert!(tx.push(voc(10)));
    let report = writer.flush().await.unwrap();
    assert_eq!(report.items, 1);
    assert_eq!(backend.row_count("VOC_DATA"), 1);
    assert_eq!(backend.row_count("RADON_DATA"), 0);
}

#[tokio::test]
async fn duplicate_keys_are_ignored_but_pdu_rows_append() {
    let backend = MemoryBackend::new();
    let (tx, mut writer) = writer(&backend);
    writer.ensure_schema().await.unwrap();

    tx.push(radon(5));
    tx.push(radon(5));
    let pdu_rows: Vec<_> = (1..=8u16)
        .map(|port| {
            vec![
                SqlValue::from(at(5)),
                SqlValue::from(port),
                SqlValue::from(port % 2 == 1),
                SqlValue::from(10.0),
                SqlValue::from(45.0),
                SqlValue::from(100.0),
            ]
        })
        .collect();
    tx.push(PersistenceItem::batch(RecordKind::Pdu, pdu_rows.clone()));
    tx.push(PersistenceItem::batch(RecordKind::Pdu, pdu_rows));

    let report = writer.flush().await.unwrap();
    assert_eq!(report.items, 4);
    assert_eq!(report.rows, 18);
    assert_eq!(report.kinds, 2);
    assert_eq!(backend.row_count("RADON_DATA"), 1);
    assert_eq!(backend.row_count("PDU_DATA"), 16);
}

#[tokio::test]
async fn stop_flushes_remaining_items_and_closes_pool() {
    let backend = MemoryBackend::new();
    let (tx, writer) = writer(&backend);
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(writer.run(stop_rx));

    tx.push(voc(1));
    tx.push(voc(2));
    tokio::task::yield_now().await;
    stop.send(()).unwrap();

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.items, 2);
    assert_eq!(backend.row_count("VOC_DATA"), 2);
    assert!(backend.is_closed());
}

#[tokio::test(start_paused = true)]
async fn schema_setup_is_retried_before_the_timer_starts() {
    let backend = MemoryBackend::new();
    backend.fail_next_ddl(2);
    let (tx, writer) = writer(&backend);
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(writer.run(stop_rx));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(backend.ddl_log().is_empty());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(backend
        .ddl_log()
        .iter()
        .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS PDU_DATA")));

    tx.push(radon(1));
    stop.send(()).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.items, 1);
    assert_eq!(backend.row_count("RADON_DATA"), 1);
}
