//! Core library for the rust_scan application.
//!
//! Controls document/photo scanners that describe themselves through a flat
//! list of typed, constrained options (the SANE device-control model) and
//! streams images back line by line.
//!
//! - [`device`]: protocol boundary, backends, device enumeration
//! - [`option`] / [`registry`]: typed option model of an opened device
//! - [`scanner`]: the opened device and the apply/reload protocol
//! - [`acquisition`]: scan lifecycle, preview handling, image buffer
//! - [`worker`]: background thread that pumps the line-read loop
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rust_scan::{config::WorkerConfig, device::mock::MockBackend, scanner::Scanner, worker::*};
//!
//! let scanner = Arc::new(Scanner::open(&MockBackend::new(), MockBackend::FLATBED_NAME)?);
//! scanner.set_option_value("resolution", 150)?;
//!
//! let (worker, mut events) = ScanWorker::spawn(&WorkerConfig::default())?;
//! worker.scan(scanner.clone(), false);
//! while let Some(event) = events.recv().await {
//!     if let WorkerEvent::ScanComplete(done) = event {
//!         println!("{done:?}");
//!         break;
//!     }
//! }
//! ```

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod option;
pub mod registry;
pub mod scanner;
pub mod worker;

pub use error::{AppResult, ScanError};
