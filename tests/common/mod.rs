//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use rust_scan::device::mock::MockDevice;
use rust_scan::device::RawConstraint;
use rust_scan::scanner::Scanner;

/// Flatbed whose resolutions include tiny values, so full scans stay small.
pub fn small_flatbed() -> Arc<MockDevice> {
    let device = Arc::new(MockDevice::flatbed());
    device.on_write("short-resolution", |_, _| {});
    device.replace_constraint(
        "resolution",
        RawConstraint::WordList(vec![5, 10, 20, 150, 300]),
    );
    device
}

/// Open `device` and forget the writes made while opening.
pub fn open(device: &Arc<MockDevice>) -> Arc<Scanner> {
    let scanner = Arc::new(Scanner::from_device("mock:flatbed", device.clone()));
    device.clear_writes();
    scanner
}

/// Small flatbed opened at 10 dpi (85 x 117 px in color).
pub fn small_scanner() -> (Arc<MockDevice>, Arc<Scanner>) {
    let device = small_flatbed();
    let scanner = open(&device);
    scanner
        .set_option_value("resolution", 10)
        .expect("10 dpi is in the list");
    device.clear_writes();
    (device, scanner)
}
