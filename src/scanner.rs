//! Opened scanner device and the apply/reload protocol.
//!
//! A [`Scanner`] owns the option registry of one opened device and decides
//! what happens to every option write:
//!
//! | State    | Option                    | Effect                                  |
//! |----------|---------------------------|-----------------------------------------|
//! | any      | inactive or not settable  | ignored                                 |
//! | any      | value equals current      | nothing written, nothing raised         |
//! | Idle     | settable and active       | written now, outcome decides the reload |
//! | Scanning | settable and active       | stored and marked unapplied             |
//!
//! During a preview scan, writes to the resolution, scan-area and preview
//! options are always deferred, even when equal to the preview value.
//!
//! Unapplied values are flushed in registry order when the scan ends (see
//! [`Scanner::cancel`]). Reloads are announced on a broadcast channel as
//! [`OptionEvent`]s so any number of UI layers can follow the model.
//!
//! The state mutex is only held for short bookkeeping while a scan is
//! running, so controller writes during a scan never wait on device I/O.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::acquisition::ScanSession;
use crate::device::{ScannerBackend, ScannerDevice, SetInfo};
use crate::error::{AppResult, ScanError};
use crate::option::{DeviceOption, OptionValue};
use crate::registry::OptionRegistry;

const EVENT_CAPACITY: usize = 64;

/// Change notification raised by the apply/reload protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionEvent {
    /// One option was re-read from the device.
    OptionChanged {
        /// Model index of the option.
        index: usize,
        /// Name of the option.
        name: String,
    },
    /// Every option was reloaded.
    OptionsChanged,
}

/// Refresh required after a device write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reload {
    /// Exact write without side effects.
    NoChange,
    /// The device snapped the value; only this option is re-read.
    One,
    /// Other options may have changed; everything is re-read.
    All,
}

impl Reload {
    /// Classify the side-effect report of a write.
    pub fn from_info(info: SetInfo) -> Self {
        if info.contains(SetInfo::RELOAD_OPTIONS) {
            Self::All
        } else if info.contains(SetInfo::INEXACT) {
            Self::One
        } else {
            Self::NoChange
        }
    }
}

/// What a call to [`Scanner::set_option_value`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value equals the current one.
    Unchanged,
    /// Unknown, inactive or read-only option, or incompatible value.
    Ignored,
    /// Stored and queued until the running scan ends.
    Deferred,
    /// Written to the device.
    Applied(Reload),
}

pub(crate) struct ScannerState {
    pub(crate) registry: OptionRegistry,
    pub(crate) session: Option<ScanSession>,
}

/// One opened scanner device.
pub struct Scanner {
    name: String,
    pub(crate) device: Arc<dyn ScannerDevice>,
    pub(crate) state: Mutex<ScannerState>,
    events: broadcast::Sender<OptionEvent>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("name", &self.name)
            .field("scanning", &self.is_scanning())
            .finish()
    }
}

impl Scanner {
    /// Open `name` through `backend` and build its option registry.
    pub fn open(backend: &dyn ScannerBackend, name: &str) -> AppResult<Self> {
        backend.init()?;
        let device = backend.open(name)?;
        Ok(Self::from_device(name, device))
    }

    /// Wrap an already opened device handle.
    pub fn from_device(name: &str, device: Arc<dyn ScannerDevice>) -> Self {
        let registry = OptionRegistry::build(device.as_ref());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let scanner = Self {
            name: name.to_string(),
            device,
            state: Mutex::new(ScannerState {
                registry,
                session: None,
            }),
            events,
        };

        // Some backends hide most resolutions until this is cleared.
        if scanner.state.lock().registry.contains("short-resolution") {
            if let Err(e) = scanner.set_option_value("short-resolution", false) {
                warn!("Could not clear short-resolution on '{}': {}", name, e);
            }
        }

        info!(
            "Opened scanner '{}' with {} options",
            scanner.name,
            scanner.state.lock().registry.len()
        );
        scanner
    }

    /// Device name the scanner was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to option change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<OptionEvent> {
        self.events.subscribe()
    }

    /// Whether a scan session is open.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Snapshot of every option in registry order.
    pub fn options(&self) -> Vec<DeviceOption> {
        self.state.lock().registry.iter().cloned().collect()
    }

    /// Snapshot of the option called `name`.
    pub fn find_option(&self, name: &str) -> Option<DeviceOption> {
        self.state.lock().registry.find(name).cloned()
    }

    /// Visit the current options in registry order.
    pub fn for_each_option(&self, visit: impl FnMut(&DeviceOption)) {
        self.state.lock().registry.for_each_option(visit);
    }

    /// Last-known value of `name`.
    pub fn option_value(&self, name: &str) -> Option<OptionValue> {
        self.state
            .lock()
            .registry
            .find(name)
            .map(|option| option.value().clone())
    }

    /// Index of the current value of `name` among its allowed values.
    pub fn option_value_index(&self, name: &str) -> usize {
        self.state
            .lock()
            .registry
            .find(name)
            .map_or(0, DeviceOption::value_index)
    }

    /// Write `value` to the option called `name`.
    ///
    /// Device failures leave the model value unchanged and are returned;
    /// everything structural (unknown name, inactive option) is `Ignored`.
    pub fn set_option_value(
        &self,
        name: &str,
        value: impl Into<OptionValue>,
    ) -> AppResult<WriteOutcome> {
        let mut state = self.state.lock();
        self.write_option(&mut state, name, value.into())
    }

    /// Write the Nth allowed value of a list-constrained option.
    pub fn set_option_index(&self, name: &str, index: usize) -> AppResult<WriteOutcome> {
        let mut state = self.state.lock();
        let Some(option) = state.registry.find(name) else {
            return Ok(WriteOutcome::Ignored);
        };
        let value = option.constraint().nth_value(index, option.option_type());
        self.write_option(&mut state, name, value)
    }

    /// Re-read every option from the device and announce it.
    pub fn reload_options(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.session.is_some() {
            return Err(ScanError::AlreadyScanning);
        }
        state.registry.reload(self.device.as_ref());
        self.notify(OptionEvent::OptionsChanged);
        Ok(())
    }

    pub(crate) fn write_option(
        &self,
        state: &mut ScannerState,
        name: &str,
        value: OptionValue,
    ) -> AppResult<WriteOutcome> {
        let Some(index) = state.registry.position(name) else {
            debug!("Ignoring write to unknown option '{}'", name);
            return Ok(WriteOutcome::Ignored);
        };
        let Some(option) = state.registry.get_mut(index) else {
            return Ok(WriteOutcome::Ignored);
        };
        if !option.is_active() || !option.is_settable() {
            debug!("Ignoring write to inactive or read-only option '{}'", name);
            return Ok(WriteOutcome::Ignored);
        }
        let Some(value) = value.coerce(option.option_type()) else {
            warn!(
                "Value for option '{}' is not a {:?}, ignoring",
                name,
                option.option_type()
            );
            return Ok(WriteOutcome::Ignored);
        };
        // During a preview the model holds the preview value of the options it
        // overrides; an edit equal to it must still outlive the restore.
        let overridden = state
            .session
            .as_ref()
            .is_some_and(|session| session.overrides(name));
        if option.value() == &value && option.option_type().has_value() && !overridden {
            return Ok(WriteOutcome::Unchanged);
        }

        if state.session.is_some() {
            debug!("Deferring '{}' = {} until the scan ends", name, value);
            option.store_value(value);
            option.set_unapplied(true);
            return Ok(WriteOutcome::Deferred);
        }

        let info = self
            .device
            .set_value(option.protocol_index(), &value.to_wire())
            .map_err(|status| {
                warn!("setting option '{}' failed: {}", name, status);
                ScanError::device(format!("setting option '{name}'"), status)
            })?;
        debug!("Option '{}' set to {} ({:?})", name, value, info);
        option.store_value(value);
        option.set_unapplied(false);

        let reload = Reload::from_info(info);
        self.apply_reload(state, index, reload);
        Ok(WriteOutcome::Applied(reload))
    }

    fn apply_reload(&self, state: &mut ScannerState, index: usize, reload: Reload) {
        match reload {
            Reload::All => {
                state.registry.reload(self.device.as_ref());
                self.notify(OptionEvent::OptionsChanged);
            }
            Reload::One => {
                state.registry.refresh_option(self.device.as_ref(), index);
                if let Some(option) = state.registry.get(index) {
                    self.notify(OptionEvent::OptionChanged {
                        index,
                        name: option.name().to_string(),
                    });
                }
            }
            Reload::NoChange => {}
        }
    }

    /// Write every unapplied value in registry order. A full reload follows
    /// if any of the writes asked for one. Returns the number of writes.
    pub(crate) fn apply_unapplied(&self, state: &mut ScannerState) -> usize {
        let pending: Vec<usize> = state
            .registry
            .iter()
            .filter(|option| option.has_unapplied_value())
            .map(DeviceOption::index)
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let mut reload_all = false;
        for &index in &pending {
            let Some(option) = state.registry.get_mut(index) else {
                continue;
            };
            option.set_unapplied(false);
            let result = self
                .device
                .set_value(option.protocol_index(), &option.value().to_wire());
            match result {
                Ok(info) => match Reload::from_info(info) {
                    Reload::All => reload_all = true,
                    Reload::One if !reload_all => {
                        self.apply_reload(state, index, Reload::One);
                    }
                    _ => {}
                },
                Err(status) => {
                    warn!("applying option '{}' failed: {}", option.name(), status);
                    state.registry.refresh_option(self.device.as_ref(), index);
                }
            }
        }

        if reload_all {
            self.apply_reload(state, 0, Reload::All);
        }
        debug!(
            "Applied {} deferred option value(s), reload: {}",
            pending.len(),
            reload_all
        );
        pending.len()
    }

    fn notify(&self, event: OptionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockBackend, MockDevice};
    use crate::device::DeviceStatus;

    fn open_flatbed() -> (Arc<MockDevice>, Scanner) {
        let device = Arc::new(MockDevice::flatbed());
        let scanner = Scanner::from_device(MockBackend::FLATBED_NAME, device.clone());
        device.clear_writes();
        (device, scanner)
    }

    #[test]
    fn test_open_clears_short_resolution() {
        let device = Arc::new(MockDevice::flatbed());
        let scanner = Scanner::from_device("mock", device.clone());

        assert_eq!(device.writes(), vec!["short-resolution".to_string()]);
        let resolution = scanner.find_option("resolution").unwrap();
        assert_eq!(resolution.constraint().allowed_values().len(), 5);
    }

    #[test]
    fn test_open_through_backend() {
        let backend = MockBackend::new();
        let scanner = Scanner::open(&backend, MockBackend::FLATBED_NAME).unwrap();
        assert_eq!(scanner.name(), MockBackend::FLATBED_NAME);
        assert!(Scanner::open(&backend, "net:nowhere").is_err());
    }

    #[test]
    fn test_exact_write_is_applied_without_notification() {
        let (device, scanner) = open_flatbed();
        let mut events = scanner.subscribe();

        let outcome = scanner.set_option_value("resolution", 150).unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(Reload::NoChange));
        assert_eq!(device.writes(), vec!["resolution".to_string()]);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_same_value_is_not_written() {
        let (device, scanner) = open_flatbed();
        let mut events = scanner.subscribe();

        assert_eq!(
            scanner.set_option_value("mode", "Color").unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            scanner.set_option_value("resolution", 300.0).unwrap(),
            WriteOutcome::Unchanged
        );
        assert!(device.writes().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_inexact_write_refreshes_one_option() {
        let (_device, scanner) = open_flatbed();
        let mut events = scanner.subscribe();

        let outcome = scanner.set_option_value("brightness", 12).unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(Reload::One));
        assert_eq!(scanner.option_value("brightness"), Some(OptionValue::Int(10)));

        let index = scanner.find_option("brightness").unwrap().index();
        assert_eq!(
            events.try_recv().unwrap(),
            OptionEvent::OptionChanged {
                index,
                name: "brightness".into()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_reload_write_refreshes_everything_once() {
        let (_device, scanner) = open_flatbed();
        let mut events = scanner.subscribe();

        let outcome = scanner.set_option_value("mode", "Lineart").unwrap();
        assert_eq!(outcome, WriteOutcome::Applied(Reload::All));
        assert!(scanner.find_option("threshold").unwrap().is_active());
        assert_eq!(events.try_recv().unwrap(), OptionEvent::OptionsChanged);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_inactive_and_read_only_writes_are_ignored() {
        let (device, scanner) = open_flatbed();

        assert_eq!(
            scanner.set_option_value("threshold", 70).unwrap(),
            WriteOutcome::Ignored
        );
        assert_eq!(
            scanner.set_option_value("firmware", "2.0").unwrap(),
            WriteOutcome::Ignored
        );
        assert_eq!(
            scanner.set_option_value("no-such-option", 1).unwrap(),
            WriteOutcome::Ignored
        );
        assert_eq!(
            scanner.set_option_value("mode", 3).unwrap(),
            WriteOutcome::Ignored
        );
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_rejected_write_keeps_model_value() {
        let (_device, scanner) = open_flatbed();

        let err = scanner.set_option_value("mode", "Infrared").unwrap_err();
        assert_eq!(err.status(), Some(DeviceStatus::Invalid));
        assert_eq!(scanner.option_value("mode"), Some(OptionValue::from("Color")));
    }

    #[test]
    fn test_index_based_access() {
        let (device, scanner) = open_flatbed();

        assert_eq!(scanner.option_value_index("mode"), 2);
        scanner.set_option_index("mode", 1).unwrap();
        assert_eq!(scanner.option_value("mode"), Some(OptionValue::from("Gray")));
        assert_eq!(scanner.option_value_index("mode"), 1);

        // Out of range falls back to the first allowed value.
        scanner.set_option_index("source", 9).unwrap();
        assert_eq!(scanner.option_value("source"), Some(OptionValue::from("Flatbed")));
        assert_eq!(device.writes(), vec!["mode".to_string()]);
        assert_eq!(scanner.option_value_index("no-such-option"), 0);
    }

    #[test]
    fn test_options_snapshot_and_iteration_agree() {
        let (_device, scanner) = open_flatbed();
        let snapshot = scanner.options();

        let mut names = Vec::new();
        scanner.for_each_option(|option| names.push(option.name().to_string()));
        assert_eq!(
            names,
            snapshot.iter().map(|o| o.name().to_string()).collect::<Vec<_>>()
        );
        assert!(!scanner.is_scanning());
    }
}
