//! Background Worker
//!
//! Runs the acquisition pipeline on one dedicated OS thread so the blocking
//! device calls never happen on the controlling context.
//!
//! # Protocol
//!
//! ```text
//! controller                      worker thread
//!     │ scan(scanner, preview) ──────▶ start()
//!     │ ◀──────────────────────────── ScanStarted(image)
//!     │ ◀──────────────────────────── LineScanned { index: 0, .. }
//!     │ ◀──────────────────────────── LineScanned { index: 1, .. }
//!     │                  ...          read_scan_line() until end / error / cancel
//!     │                               cancel()   (restore preview, flush writes)
//!     │ ◀──────────────────────────── ScanComplete(..)   exactly once
//! ```
//!
//! Events travel over a bounded channel (capacity 1 by default). The worker
//! only reads the next line once the previous event is queued, so it never
//! reads ahead of what the controller has seen. The controller must keep
//! receiving until `ScanComplete`, also after [`ScanWorker::cancel_scan`].
//!
//! Panics inside the pipeline are caught at the thread boundary and reported
//! as a failed completion; the worker keeps serving later scans.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::acquisition::{ScanImage, ScanLine};
use crate::config::WorkerConfig;
use crate::error::{AppResult, ScanError};
use crate::scanner::Scanner;

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanCompletion {
    /// The device delivered every line.
    Finished,
    /// The scan was cancelled before the device ran out of data.
    Cancelled,
    /// The scan failed; carries the reason.
    Failed(String),
}

impl ScanCompletion {
    /// Whether the scan ended in failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Event reported by the worker, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The scan started; the image is allocated but empty.
    ScanStarted(ScanImage),
    /// One line of the running scan.
    LineScanned {
        /// 0-based line number, strictly increasing within a scan.
        index: usize,
        /// Line bytes.
        data: Vec<u8>,
    },
    /// The scan is over. Sent exactly once per accepted scan request.
    ScanComplete(ScanCompletion),
}

enum WorkerCommand {
    Scan {
        scanner: Arc<Scanner>,
        preview: bool,
    },
}

struct Shared {
    busy: AtomicBool,
    cancel: AtomicBool,
    current: Mutex<Option<Arc<Scanner>>>,
}

/// Handle to the scan worker thread.
pub struct ScanWorker {
    commands: Option<mpsc::UnboundedSender<WorkerCommand>>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ScanWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanWorker")
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl ScanWorker {
    /// Spawn the worker thread. Returns the handle and the event stream.
    pub fn spawn(config: &WorkerConfig) -> AppResult<(Self, mpsc::Receiver<WorkerEvent>)> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            busy: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            current: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || worker_loop(command_rx, event_tx, thread_shared))?;
        info!("Scan worker '{}' started", config.thread_name);

        Ok((
            Self {
                commands: Some(command_tx),
                shared,
                handle: Some(handle),
            },
            event_rx,
        ))
    }

    /// Whether a scan request is outstanding.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Request a scan. Returns `false` without side effects when a scan is
    /// already outstanding or the worker is gone.
    pub fn scan(&self, scanner: Arc<Scanner>, preview: bool) -> bool {
        self.try_scan(scanner, preview).is_ok()
    }

    /// Like [`ScanWorker::scan`], reporting why a request was refused.
    pub fn try_scan(&self, scanner: Arc<Scanner>, preview: bool) -> AppResult<()> {
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            debug!("Scan request ignored, worker busy");
            return Err(ScanError::AlreadyScanning);
        }
        self.shared.cancel.store(false, Ordering::SeqCst);
        *self.shared.current.lock() = Some(scanner.clone());

        let sent = self
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(WorkerCommand::Scan { scanner, preview }).is_ok());
        if !sent {
            self.shared.current.lock().take();
            self.shared.busy.store(false, Ordering::SeqCst);
            return Err(ScanError::WorkerStopped);
        }
        Ok(())
    }

    /// Cancel the outstanding scan. Tells the device to abort right away so a
    /// blocked read returns; completion is still reported once.
    pub fn cancel_scan(&self) {
        if !self.is_busy() {
            return;
        }
        self.shared.cancel.store(true, Ordering::SeqCst);
        if let Some(scanner) = self.shared.current.lock().as_ref() {
            scanner.abort();
        }
        info!("Scan cancellation requested");
    }

    /// Stop the worker and wait for the thread. A running scan is cancelled;
    /// the event receiver must still be drained or dropped for this to return.
    pub fn shutdown(mut self) {
        self.stop(true);
    }

    fn stop(&mut self, join: bool) {
        self.cancel_scan();
        self.commands.take();
        if let Some(handle) = self.handle.take() {
            if join {
                if handle.join().is_err() {
                    error!("Scan worker thread panicked");
                }
            } else if self.is_busy() {
                debug!("Scan worker still finishing a scan, detaching");
            } else if handle.join().is_err() {
                error!("Scan worker thread panicked");
            }
        }
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn worker_loop(
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::Sender<WorkerEvent>,
    shared: Arc<Shared>,
) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            WorkerCommand::Scan { scanner, preview } => {
                let completion = run_guarded(&scanner, preview, &shared.cancel, &events);
                info!("Scan on '{}' complete: {:?}", scanner.name(), completion);
                shared.current.lock().take();
                shared.busy.store(false, Ordering::SeqCst);
                if events.blocking_send(WorkerEvent::ScanComplete(completion)).is_err() {
                    debug!("Event receiver dropped, completion not delivered");
                }
            }
        }
    }
    debug!("Scan worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run one scan and its cleanup, turning panics into a failed completion.
fn run_guarded(
    scanner: &Scanner,
    preview: bool,
    cancel: &AtomicBool,
    events: &mpsc::Sender<WorkerEvent>,
) -> ScanCompletion {
    let outcome = catch_unwind(AssertUnwindSafe(|| run_scan(scanner, preview, cancel, events)));
    let completion = match outcome {
        Ok(completion) => completion,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Scan worker caught a panic: {}", message);
            ScanCompletion::Failed(format!("scan aborted unexpectedly: {message}"))
        }
    };

    // Cleanup also runs after a natural end; it restores preview settings
    // and applies deferred option writes.
    let cleanup = catch_unwind(AssertUnwindSafe(|| scanner.cancel()));
    match cleanup {
        Ok(Ok(())) | Ok(Err(ScanError::NotScanning)) => {}
        Ok(Err(e)) => warn!("Scan cleanup failed: {}", e),
        Err(payload) => error!(
            "Scan cleanup panicked: {}",
            panic_message(payload.as_ref())
        ),
    }
    completion
}

fn run_scan(
    scanner: &Scanner,
    preview: bool,
    cancel: &AtomicBool,
    events: &mpsc::Sender<WorkerEvent>,
) -> ScanCompletion {
    if cancel.load(Ordering::SeqCst) {
        return ScanCompletion::Cancelled;
    }
    let image = match scanner.start(preview) {
        Ok(image) => image,
        Err(e) => {
            error!("{}", e);
            return ScanCompletion::Failed(e.to_string());
        }
    };
    if events.blocking_send(WorkerEvent::ScanStarted(image)).is_err() {
        warn!("Event receiver dropped, abandoning scan");
        return ScanCompletion::Cancelled;
    }

    loop {
        if cancel.load(Ordering::SeqCst) {
            return ScanCompletion::Cancelled;
        }
        match scanner.read_scan_line() {
            Ok(ScanLine::Line { index, data }) => {
                if cancel.load(Ordering::SeqCst) {
                    debug!("Discarding line {} read after cancellation", index);
                    return ScanCompletion::Cancelled;
                }
                if events
                    .blocking_send(WorkerEvent::LineScanned { index, data })
                    .is_err()
                {
                    warn!("Event receiver dropped, abandoning scan");
                    return ScanCompletion::Cancelled;
                }
            }
            Ok(ScanLine::EndOfData) => return ScanCompletion::Finished,
            Ok(ScanLine::Cancelled) => return ScanCompletion::Cancelled,
            Err(e) => {
                error!("{}", e);
                return ScanCompletion::Failed(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use crate::device::RawConstraint;

    fn tiny_scanner() -> (Arc<MockDevice>, Arc<Scanner>) {
        let device = Arc::new(MockDevice::flatbed());
        device.on_write("short-resolution", |_, _| {});
        device.replace_constraint("resolution", RawConstraint::WordList(vec![5, 300]));
        let scanner = Arc::new(Scanner::from_device("mock", device.clone()));
        scanner.set_option_value("resolution", 5).unwrap();
        (device, scanner)
    }

    #[tokio::test]
    async fn test_scan_reports_started_lines_and_one_completion() {
        let (_device, scanner) = tiny_scanner();
        let (worker, mut events) = ScanWorker::spawn(&WorkerConfig::default()).unwrap();

        assert!(worker.scan(scanner.clone(), false));
        let Some(WorkerEvent::ScanStarted(image)) = events.recv().await else {
            panic!("expected ScanStarted");
        };

        let mut lines = 0;
        loop {
            match events.recv().await.unwrap() {
                WorkerEvent::LineScanned { index, .. } => {
                    assert_eq!(index, lines);
                    lines += 1;
                }
                WorkerEvent::ScanComplete(completion) => {
                    assert_eq!(completion, ScanCompletion::Finished);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(lines, image.height);
        assert!(!scanner.is_scanning());
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_second_request_rejected_while_busy() {
        let (device, scanner) = tiny_scanner();
        device.set_line_delay(Some(std::time::Duration::from_millis(5)));
        let (worker, mut events) = ScanWorker::spawn(&WorkerConfig::default()).unwrap();

        assert!(worker.scan(scanner.clone(), false));
        assert!(!worker.scan(scanner.clone(), false));
        assert!(matches!(
            worker.try_scan(scanner.clone(), true),
            Err(ScanError::AlreadyScanning)
        ));

        worker.cancel_scan();
        let mut completions = 0;
        while let Some(event) = events.recv().await {
            if let WorkerEvent::ScanComplete(_) = event {
                completions += 1;
                break;
            }
        }
        assert_eq!(completions, 1);
        assert!(!worker.is_busy());
        worker.shutdown();
    }
}
