//! Apply/reload protocol integration tests
//!
//! Drives a [`Scanner`] over the simulated flatbed and checks what reaches
//! the device, and when:
//! - writes equal to the current value never reach the device
//! - writes during a scan are deferred and flushed in registry order
//! - the flush reloads everything only if one of the writes asked for it

mod common;

use rust_scan::acquisition::ScanLine;
use rust_scan::option::OptionValue;
use rust_scan::scanner::{OptionEvent, Reload, WriteOutcome};

#[test]
fn test_idempotent_write_touches_nothing() {
    let (device, scanner) = common::small_scanner();
    let mut events = scanner.subscribe();

    for option in scanner.options() {
        if option.is_active() && option.is_settable() && option.option_type().has_value() {
            let outcome = scanner
                .set_option_value(option.name(), option.value().clone())
                .unwrap();
            assert_eq!(outcome, WriteOutcome::Unchanged, "option {}", option.name());
        }
    }

    assert!(device.writes().is_empty());
    assert!(events.try_recv().is_err());
}

#[test]
fn test_idempotent_write_while_scanning_is_not_deferred() {
    let (device, scanner) = common::small_scanner();
    scanner.start(false).unwrap();

    assert_eq!(
        scanner.set_option_value("mode", "Color").unwrap(),
        WriteOutcome::Unchanged
    );
    assert!(!scanner.find_option("mode").unwrap().has_unapplied_value());

    scanner.cancel().unwrap();
    assert!(device.writes().is_empty());
}

#[test]
fn test_deferred_writes_flush_in_registry_order_with_reload() {
    let (device, scanner) = common::small_scanner();
    scanner.start(false).unwrap();
    let mut events = scanner.subscribe();

    // Issued out of registry order on purpose.
    assert_eq!(
        scanner.set_option_value("brightness", 20).unwrap(),
        WriteOutcome::Deferred
    );
    assert_eq!(
        scanner.set_option_value("resolution", 20).unwrap(),
        WriteOutcome::Deferred
    );
    assert_eq!(
        scanner.set_option_value("mode", "Lineart").unwrap(),
        WriteOutcome::Deferred
    );
    assert!(device.writes().is_empty());
    assert!(scanner.find_option("brightness").unwrap().has_unapplied_value());

    scanner.cancel().unwrap();

    assert_eq!(device.writes(), vec!["mode", "resolution", "brightness"]);
    assert_eq!(events.try_recv().unwrap(), OptionEvent::OptionsChanged);
    assert!(events.try_recv().is_err());
    assert!(scanner.find_option("threshold").unwrap().is_active());
    assert!(scanner
        .options()
        .iter()
        .all(|option| !option.has_unapplied_value()));
}

#[test]
fn test_deferred_writes_without_reload_raise_nothing() {
    let (device, scanner) = common::small_scanner();
    scanner.start(false).unwrap();
    let mut events = scanner.subscribe();

    scanner.set_option_value("brightness", 20).unwrap();
    scanner.set_option_value("resolution", 20).unwrap();
    scanner.cancel().unwrap();

    assert_eq!(device.writes(), vec!["resolution", "brightness"]);
    assert!(events.try_recv().is_err());
    assert_eq!(scanner.option_value("resolution"), Some(OptionValue::Int(20)));
}

#[test]
fn test_deferred_inexact_write_is_resynced() {
    let (_device, scanner) = common::small_scanner();
    scanner.start(false).unwrap();
    let mut events = scanner.subscribe();

    scanner.set_option_value("brightness", 33).unwrap();
    assert_eq!(scanner.option_value("brightness"), Some(OptionValue::Int(33)));
    scanner.cancel().unwrap();

    assert_eq!(scanner.option_value("brightness"), Some(OptionValue::Int(35)));
    assert!(matches!(
        events.try_recv().unwrap(),
        OptionEvent::OptionChanged { ref name, .. } if name == "brightness"
    ));
}

#[test]
fn test_flush_also_runs_after_natural_end() {
    let (device, scanner) = common::small_scanner();
    scanner.start(false).unwrap();
    scanner.set_option_value("source", "ADF").unwrap();

    while let ScanLine::Line { .. } = scanner.read_scan_line().unwrap() {}
    scanner.cancel().unwrap();

    assert_eq!(device.writes(), vec!["source"]);
    let br_y = scanner.find_option("br-y").unwrap();
    let (_, max) = br_y.constraint().min_max().unwrap();
    assert!((max - 355.6).abs() < 1e-3);
}

#[test]
fn test_scan_failure_keeps_deferred_edits() {
    let (device, scanner) = common::small_scanner();
    device.fail_read_at_line(0, rust_scan::device::DeviceStatus::IoError);
    scanner.start(false).unwrap();
    scanner.set_option_value("resolution", 5).unwrap();

    assert!(scanner.read_scan_line().is_err());
    scanner.cancel().unwrap();

    assert_eq!(device.writes(), vec!["resolution"]);
    assert!(!scanner.is_scanning());
}

#[test]
fn test_idle_write_outcomes() {
    let (_device, scanner) = common::small_scanner();

    assert_eq!(
        scanner.set_option_value("resolution", 150).unwrap(),
        WriteOutcome::Applied(Reload::NoChange)
    );
    assert_eq!(
        scanner.set_option_value("brightness", -2).unwrap(),
        WriteOutcome::Applied(Reload::One)
    );
    assert_eq!(
        scanner.set_option_value("source", "ADF").unwrap(),
        WriteOutcome::Applied(Reload::All)
    );
}
