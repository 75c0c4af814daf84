//! Configuration loading and validation.

use lab_monitor::app::MonitorApp;
use lab_monitor::config::MonitorConfig;
use lab_monitor::telemetry::channels::hv_slot_key;
use lab_monitor::telemetry::TelemetryStore;
use std::io::Write;
use std::time::Duration;

const EXAMPLE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config/monitor.example.toml");

fn parse(toml_str: &str) -> MonitorConfig {
    toml::from_str(toml_str).expect("Failed to parse test config")
}

fn validation_error(toml_str: &str) -> String {
    parse(toml_str)
        .validate()
        .expect_err("config should be rejected")
        .to_string()
}

#[test]
fn test_example_config_loads_and_validates() {
    let config = MonitorConfig::load_from(EXAMPLE).expect("Failed to load example config");
    config.validate().expect("Example config should be valid");

    assert_eq!(config.retention.days, 31);
    assert_eq!(config.database.flush_interval, Duration::from_secs(60));
    assert_eq!(config.shutdown.join_timeout, Duration::from_secs(5));
    assert_eq!(config.caen_hv.slots(), vec![(0, 12), (2, 12)]);
    assert_eq!(config.pdu.outlets.get("1").map(String::as_str), Some("HV crate"));
    assert_eq!(config.daq.modules.len(), 2);
}

#[test]
fn test_example_config_builds_every_channel() {
    let config = MonitorConfig::load_from(EXAMPLE).expect("Failed to load example config");
    let store = TelemetryStore::from_config(&config).expect("Failed to build store");
    let keys = store.channel_keys();

    for key in ["LS", "RADON", "MAG", "TH_O2", "FIRE", "VOC", "UPS", "PDU"] {
        assert!(keys.iter().any(|k| k == key), "missing channel {key}");
    }
    assert!(keys.contains(&hv_slot_key(0)));
    assert!(keys.contains(&hv_slot_key(2)));
    assert!(store.snapshot(&hv_slot_key(2)).unwrap().column("ch11.IMon").is_some());
}

#[test]
fn test_load_from_tempfile_fills_defaults() {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(file, "[pdu]\nenabled = true\nip_address = \"10.0.0.5\"").unwrap();

    let config = MonitorConfig::load_from(file.path()).expect("Failed to load config");
    assert!(config.pdu.enabled);
    assert_eq!(config.pdu.port_count, 8);
    assert!(!config.ups.enabled);
    assert_eq!(config.application.log_level, "info");
    config.validate().expect("Defaults should be valid");
}

#[test]
fn test_malformed_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(file, "[retention]\ndays = \"forever\"").unwrap();
    assert!(MonitorConfig::load_from(file.path()).is_err());
}

#[test]
fn test_nonpositive_interval_rejected_only_when_enabled() {
    let err = validation_error("[ups]\nenabled = true\ninterval_s = 0.0");
    assert!(err.contains("ups.interval_s"), "{err}");

    parse("[ups]\nenabled = false\ninterval_s = 0.0")
        .validate()
        .expect("Disabled devices are not checked");
}

#[test]
fn test_nan_interval_rejected() {
    let err = validation_error("[voc]\nenabled = true\ninterval_s = nan");
    assert!(err.contains("voc.interval_s"), "{err}");
}

#[test]
fn test_zero_retention_rejected() {
    let err = validation_error("[retention]\ndays = 0");
    assert!(err.contains("retention.days"), "{err}");
}

#[test]
fn test_degenerate_distance_mapping_rejected() {
    let err = validation_error(
        r#"
        [daq]
        enabled = true

        [[daq.modules]]
        role = "distance"
        serial_number = "0xABCD"
        task_type = "volt"
        channels = ["ai0"]
        mapping = [{ volt_range = [2.0, 2.0], dist_range_mm = [0.0, 50.0] }]
        "#,
    );
    assert!(err.contains("degenerate"), "{err}");
}

#[test]
fn test_bad_serial_number_rejected() {
    let err = validation_error(
        r#"
        [daq]
        enabled = true

        [[daq.modules]]
        role = "rtd"
        serial_number = "not-hex"
        task_type = "rtd"
        channels = ["ai0"]
        "#,
    );
    assert!(err.contains("not-hex"), "{err}");
}

#[test]
fn test_hv_slot_keys_must_be_numbers() {
    let err = validation_error(
        r#"
        [caen_hv]
        enabled = true

        [caen_hv.crate_map]
        "front" = { channels = 4 }
        "#,
    );
    assert!(err.contains("front"), "{err}");
}

#[test]
fn test_pdu_outlet_outside_port_range_rejected() {
    let err = validation_error(
        r#"
        [pdu]
        enabled = true
        port_count = 4

        [pdu.outlets]
        "5" = "Spare"
        "#,
    );
    assert!(err.contains("pdu.outlets"), "{err}");
}

#[test]
fn test_disabled_database_opens_no_backend() {
    let config = parse("[database]\nenabled = false");
    let backend = tokio_test::block_on(MonitorApp::connect_backend(&config));
    assert!(backend.is_none());
}
