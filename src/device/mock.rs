//! Mock Scanner Backend
//!
//! Simulated flatbed scanner for testing without hardware. The mock behaves
//! like a well-mannered real device:
//!
//! - option writes are rejected with `DeviceBusy` while a frame is being read
//! - ranges with a quantization step and word lists snap values and report
//!   `INEXACT`
//! - writing `source`, `mode` or `short-resolution` changes other options and
//!   reports `RELOAD_OPTIONS`
//! - `start` derives the frame geometry from mode, resolution and scan area
//! - `cancel` is callable while another thread is blocked in `read`
//!
//! Every accepted write is recorded so tests can check what reached the
//! device and in which order.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = Arc::new(MockDevice::flatbed());
//! let scanner = Scanner::from_device("mock:flatbed", device.clone());
//! scanner.set_option_value("resolution", 150)?;
//! assert_eq!(device.writes().last().map(String::as_str), Some("resolution"));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    fix, unfix, Capabilities, DeviceInfo, DeviceStatus, FrameFormat, OptionDescriptor,
    RawConstraint, ScanParameters, ScannerBackend, ScannerDevice, SetInfo, Unit, ValueType,
    WireValue, Word, WORD_SIZE,
};
use crate::error::{AppResult, ScanError};

const MM_PER_INCH: f64 = 25.4;
const STRING_SIZE: usize = 32;

/// Side effect of writing an option: may edit the other options.
type WriteEffect = Box<dyn Fn(&WireValue, &mut Vec<MockOption>) + Send + Sync>;

// =============================================================================
// MockBackend
// =============================================================================

/// Backend exposing the simulated flatbed plus any extra listed devices.
pub struct MockBackend {
    initialized: Mutex<bool>,
    devices: Mutex<Vec<DeviceInfo>>,
}

impl MockBackend {
    /// Device name of the simulated flatbed.
    pub const FLATBED_NAME: &'static str = "mock:flatbed";

    /// Backend listing only the simulated flatbed.
    pub fn new() -> Self {
        Self {
            initialized: Mutex::new(false),
            devices: Mutex::new(vec![DeviceInfo {
                name: Self::FLATBED_NAME.to_string(),
                vendor: "Mock".to_string(),
                model: "Flatbed 9000".to_string(),
                device_type: "flatbed scanner".to_string(),
            }]),
        }
    }

    /// List an extra device. Only the flatbed can actually be opened.
    pub fn add_device(&self, info: DeviceInfo) {
        self.devices.lock().push(info);
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerBackend for MockBackend {
    fn init(&self) -> AppResult<()> {
        let mut initialized = self.initialized.lock();
        if !*initialized {
            *initialized = true;
            info!("Mock scanner backend initialized");
        }
        Ok(())
    }

    fn exit(&self) {
        let mut initialized = self.initialized.lock();
        if *initialized {
            *initialized = false;
            info!("Mock scanner backend shut down");
        }
    }

    fn devices(&self, _local_only: bool) -> AppResult<Vec<DeviceInfo>> {
        if !*self.initialized.lock() {
            return Err(ScanError::device("enumerating devices", DeviceStatus::Invalid));
        }
        Ok(self.devices.lock().clone())
    }

    fn open(&self, name: &str) -> AppResult<Arc<dyn ScannerDevice>> {
        if name != Self::FLATBED_NAME {
            return Err(ScanError::device(
                format!("opening device {name}"),
                DeviceStatus::Invalid,
            ));
        }
        Ok(Arc::new(MockDevice::flatbed()))
    }
}

// =============================================================================
// MockDevice
// =============================================================================

/// One simulated option: descriptor plus current wire value.
#[derive(Debug, Clone)]
pub struct MockOption {
    /// Descriptor reported to the core.
    pub desc: OptionDescriptor,
    /// Current value.
    pub value: WireValue,
}

impl MockOption {
    fn words(&self) -> Option<&[Word]> {
        match &self.value {
            WireValue::Words(words) => Some(words),
            _ => None,
        }
    }
}

fn find_mut<'a>(options: &'a mut [MockOption], name: &str) -> Option<&'a mut MockOption> {
    options.iter_mut().find(|o| o.desc.name == name)
}

fn set_active(options: &mut [MockOption], name: &str, active: bool) {
    if let Some(option) = find_mut(options, name) {
        option.desc.capabilities.set(Capabilities::INACTIVE, !active);
    }
}

fn set_constraint(options: &mut [MockOption], name: &str, constraint: RawConstraint) {
    if let Some(option) = find_mut(options, name) {
        option.desc.constraint = constraint;
    }
}

struct ScanState {
    params: ScanParameters,
    total_bytes: usize,
    sent_bytes: usize,
}

struct MockState {
    options: Vec<MockOption>,
    effects: HashMap<String, WriteEffect>,
    read_failures: HashMap<String, DeviceStatus>,
    start_failure: Option<DeviceStatus>,
    line_failure: Option<(usize, DeviceStatus)>,
    forced_parameters: Option<ScanParameters>,
    writes: Vec<String>,
    scan: Option<ScanState>,
}

/// Simulated scanner device.
pub struct MockDevice {
    state: Mutex<MockState>,
    cancelled: AtomicBool,
    cancel_calls: AtomicUsize,
    line_delay: Mutex<Option<Duration>>,
    start_delay: Mutex<Option<Duration>>,
}

impl MockDevice {
    /// Device with the given options and no write side effects.
    pub fn new(options: Vec<MockOption>) -> Self {
        Self {
            state: Mutex::new(MockState {
                options,
                effects: HashMap::new(),
                read_failures: HashMap::new(),
                start_failure: None,
                line_failure: None,
                forced_parameters: None,
                writes: Vec::new(),
                scan: None,
            }),
            cancelled: AtomicBool::new(false),
            cancel_calls: AtomicUsize::new(0),
            line_delay: Mutex::new(None),
            start_delay: Mutex::new(None),
        }
    }

    /// Letter-size flatbed with an optional document feeder.
    pub fn flatbed() -> Self {
        let rw = Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT;
        let options = vec![
            group("Standard"),
            string_option(
                "mode",
                "Scan mode",
                &["Lineart", "Gray", "Color"],
                "Color",
            ),
            string_option("source", "Scan source", &["Flatbed", "ADF"], "Flatbed"),
            MockOption {
                desc: OptionDescriptor {
                    name: "resolution".into(),
                    title: "Scan resolution".into(),
                    description: "Sets the resolution of the scanned image.".into(),
                    value_type: ValueType::Int,
                    unit: Unit::Dpi,
                    size: WORD_SIZE,
                    capabilities: rw,
                    constraint: RawConstraint::WordList(vec![75, 150, 300]),
                },
                value: WireValue::Words(vec![300]),
            },
            bool_option(
                "short-resolution",
                "Short resolution list",
                rw | Capabilities::ADVANCED,
                true,
            ),
            bool_option("preview", "Preview", rw, false),
            group("Geometry"),
            fixed_option("tl-x", "Top-left x", 215.9, 0.0),
            fixed_option("tl-y", "Top-left y", 297.18, 0.0),
            fixed_option("br-x", "Bottom-right x", 215.9, 215.9),
            fixed_option("br-y", "Bottom-right y", 297.18, 297.18),
            group("Enhancement"),
            int_option("brightness", "Brightness", Unit::Percent, rw, (-100, 100, 5), 0),
            int_option(
                "threshold",
                "Threshold",
                Unit::Percent,
                rw | Capabilities::INACTIVE,
                (0, 100, 1),
                50,
            ),
            int_option(
                "lamp-off-time",
                "Lamp off time",
                Unit::None,
                rw | Capabilities::ADVANCED,
                (0, 60, 0),
                15,
            ),
            MockOption {
                desc: OptionDescriptor {
                    name: "calibrate".into(),
                    title: "Calibrate".into(),
                    description: "Run lamp calibration.".into(),
                    value_type: ValueType::Button,
                    unit: Unit::None,
                    size: 0,
                    capabilities: Capabilities::SOFT_SELECT | Capabilities::ADVANCED,
                    constraint: RawConstraint::None,
                },
                value: WireValue::None,
            },
            MockOption {
                desc: OptionDescriptor {
                    name: "firmware".into(),
                    title: "Firmware version".into(),
                    description: "Firmware revision reported by the device.".into(),
                    value_type: ValueType::String,
                    unit: Unit::None,
                    size: STRING_SIZE,
                    capabilities: Capabilities::SOFT_DETECT,
                    constraint: RawConstraint::None,
                },
                value: WireValue::Text("1.0.4".into()),
            },
        ];

        let device = Self::new(options);
        device.on_write("source", |value, options| {
            let adf = matches!(value, WireValue::Text(s) if s == "ADF");
            let length = if adf { 355.6 } else { 297.18 };
            for name in ["tl-y", "br-y"] {
                set_constraint(options, name, fixed_range(length));
            }
            if let Some(br_y) = find_mut(options, "br-y") {
                br_y.value = WireValue::Words(vec![fix(length)]);
            }
        });
        device.on_write("mode", |value, options| {
            let lineart = matches!(value, WireValue::Text(s) if s == "Lineart");
            set_active(options, "threshold", lineart);
        });
        device.on_write("short-resolution", |value, options| {
            let short = matches!(value, WireValue::Words(w) if w.first() == Some(&1));
            let list = if short {
                vec![75, 150, 300]
            } else {
                vec![75, 150, 300, 600, 1200]
            };
            set_constraint(options, "resolution", RawConstraint::WordList(list));
        });
        device
    }

    /// Append an option after the existing ones.
    pub fn push_option(&self, option: MockOption) {
        self.state.lock().options.push(option);
    }

    /// Replace the option with the same name, keeping its position.
    pub fn replace_option(&self, option: MockOption) {
        let mut state = self.state.lock();
        if let Some(existing) = find_mut(&mut state.options, &option.desc.name) {
            *existing = option;
        }
    }

    /// Register a side effect for writes to `name`. The write then reports
    /// `RELOAD_OPTIONS`.
    pub fn on_write(
        &self,
        name: &str,
        effect: impl Fn(&WireValue, &mut Vec<MockOption>) + Send + Sync + 'static,
    ) {
        self.state
            .lock()
            .effects
            .insert(name.to_string(), Box::new(effect));
    }

    /// Swap the constraint of `name` without going through a write.
    pub fn replace_constraint(&self, name: &str, constraint: RawConstraint) {
        set_constraint(&mut self.state.lock().options, name, constraint);
    }

    /// Toggle the inactive capability of `name`.
    pub fn set_option_active(&self, name: &str, active: bool) {
        set_active(&mut self.state.lock().options, name, active);
    }

    /// Make every read of `name` fail with `status`.
    pub fn fail_reads_of(&self, name: &str, status: DeviceStatus) {
        self.state
            .lock()
            .read_failures
            .insert(name.to_string(), status);
    }

    /// Make the next `start` calls fail with `status`.
    pub fn fail_start(&self, status: Option<DeviceStatus>) {
        self.state.lock().start_failure = status;
    }

    /// Fail the read of line `line` (0-based) with `status`.
    pub fn fail_read_at_line(&self, line: usize, status: DeviceStatus) {
        self.state.lock().line_failure = Some((line, status));
    }

    /// Sleep this long before serving each read.
    pub fn set_line_delay(&self, delay: Option<Duration>) {
        *self.line_delay.lock() = delay;
    }

    /// Sleep this long in `start`, as a lamp warm-up would.
    pub fn set_start_delay(&self, delay: Option<Duration>) {
        *self.start_delay.lock() = delay;
    }

    /// Report `params` from `start` on instead of the geometry derived from
    /// the options.
    pub fn force_parameters(&self, params: Option<ScanParameters>) {
        self.state.lock().forced_parameters = params;
    }

    /// Number of options, groups included.
    pub fn option_count(&self) -> usize {
        self.state.lock().options.len()
    }

    /// Names of the options written so far, in write order.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Current wire value of `name`.
    pub fn wire_value(&self, name: &str) -> Option<WireValue> {
        let state = self.state.lock();
        state
            .options
            .iter()
            .find(|o| o.desc.name == name)
            .map(|o| o.value.clone())
    }

    /// Whether a frame is being acquired.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan.is_some()
    }

    /// How many times `cancel` was called.
    pub fn cancel_count(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn negotiate(options: &[MockOption]) -> ScanParameters {
        let get = |name: &str| options.iter().find(|o| o.desc.name == name);
        let number = |name: &str| {
            get(name)
                .and_then(|o| o.words().and_then(|w| w.first()).map(|w| (o.desc.value_type, *w)))
                .map(|(ty, w)| match ty {
                    ValueType::Fixed => unfix(w),
                    _ => f64::from(w),
                })
        };

        let resolution = number("resolution").unwrap_or(75.0);
        let x_res = number("x-resolution").unwrap_or(resolution);
        let y_res = number("y-resolution").unwrap_or(resolution);
        let pixel_geometry = get("br-x").is_some_and(|o| o.desc.unit == Unit::Pixel);

        let extent = |tl: &str, br: &str, dpi: f64| {
            let span = number(br).unwrap_or(0.0) - number(tl).unwrap_or(0.0);
            let pixels = if pixel_geometry {
                span
            } else {
                span / MM_PER_INCH * dpi
            };
            pixels.round().max(1.0) as usize
        };
        let pixels_per_line = extent("tl-x", "br-x", x_res);
        let lines = extent("tl-y", "br-y", y_res);

        let mode = get("mode").and_then(|o| match &o.value {
            WireValue::Text(s) => Some(s.clone()),
            _ => None,
        });
        let (format, depth, bytes_per_line) = match mode.as_deref() {
            Some("Lineart") => (FrameFormat::Gray, 1, pixels_per_line.div_ceil(8)),
            Some("Gray") => (FrameFormat::Gray, 8, pixels_per_line),
            _ => (FrameFormat::Rgb, 8, pixels_per_line * 3),
        };

        ScanParameters {
            format,
            last_frame: true,
            bytes_per_line,
            pixels_per_line,
            lines: Some(lines),
            depth,
        }
    }
}

/// Snap `value` to the constraint. Returns the legal value and whether it
/// differs from the request.
fn snap(constraint: &RawConstraint, value: Word) -> (Word, bool) {
    let legal = match constraint {
        RawConstraint::Range { min, max, quant } => {
            let clamped = value.clamp(*min, *max);
            if *quant > 0 {
                let steps = (f64::from(clamped - min) / f64::from(*quant)).round() as Word;
                (min + steps * quant).min(*max)
            } else {
                clamped
            }
        }
        RawConstraint::WordList(words) => words
            .iter()
            .copied()
            .min_by_key(|w| (i64::from(*w) - i64::from(value)).abs())
            .unwrap_or(value),
        _ => value,
    };
    (legal, legal != value)
}

impl ScannerDevice for MockDevice {
    fn option_descriptor(&self, index: usize) -> Option<OptionDescriptor> {
        let state = self.state.lock();
        index
            .checked_sub(1)
            .and_then(|i| state.options.get(i))
            .map(|o| o.desc.clone())
    }

    fn get_value(&self, index: usize) -> Result<WireValue, DeviceStatus> {
        let state = self.state.lock();
        let option = index
            .checked_sub(1)
            .and_then(|i| state.options.get(i))
            .ok_or(DeviceStatus::Invalid)?;
        if let Some(status) = state.read_failures.get(&option.desc.name) {
            return Err(*status);
        }
        if option.desc.capabilities.contains(Capabilities::INACTIVE) {
            return Err(DeviceStatus::Invalid);
        }
        Ok(option.value.clone())
    }

    fn set_value(&self, index: usize, value: &WireValue) -> Result<SetInfo, DeviceStatus> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.scan.is_some() {
            return Err(DeviceStatus::DeviceBusy);
        }
        let position = index.checked_sub(1).ok_or(DeviceStatus::Invalid)?;
        let option = state.options.get_mut(position).ok_or(DeviceStatus::Invalid)?;
        let caps = option.desc.capabilities;
        if caps.contains(Capabilities::INACTIVE) || !caps.contains(Capabilities::SOFT_SELECT) {
            return Err(DeviceStatus::Invalid);
        }

        let mut info = SetInfo::empty();
        let stored = match (option.desc.value_type, value) {
            (ValueType::Button, _) => WireValue::None,
            (ValueType::String, WireValue::Text(text)) => {
                if let RawConstraint::StringList(list) = &option.desc.constraint {
                    if !list.contains(text) {
                        return Err(DeviceStatus::Invalid);
                    }
                }
                WireValue::Text(text.clone())
            }
            (ValueType::Bool | ValueType::Int | ValueType::Fixed, WireValue::Words(words)) => {
                let snapped: Vec<Word> = words
                    .iter()
                    .map(|w| {
                        let (legal, inexact) = snap(&option.desc.constraint, *w);
                        if inexact {
                            info |= SetInfo::INEXACT;
                        }
                        legal
                    })
                    .collect();
                WireValue::Words(snapped)
            }
            _ => return Err(DeviceStatus::Invalid),
        };

        let name = option.desc.name.clone();
        option.value = stored.clone();
        state.writes.push(name.clone());
        debug!("Mock device: '{}' set to {:?} ({:?})", name, stored, info);

        if let Some(effect) = state.effects.get(&name) {
            effect(&stored, &mut state.options);
            info |= SetInfo::RELOAD_OPTIONS | SetInfo::RELOAD_PARAMS;
        }
        Ok(info)
    }

    fn start(&self) -> Result<(), DeviceStatus> {
        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        if let Some(status) = state.start_failure {
            return Err(status);
        }
        if state.scan.is_some() {
            return Err(DeviceStatus::DeviceBusy);
        }
        let params = state
            .forced_parameters
            .unwrap_or_else(|| Self::negotiate(&state.options));
        let total_bytes = params.bytes_per_line * params.lines.unwrap_or(0);
        state.scan = Some(ScanState {
            params,
            total_bytes,
            sent_bytes: 0,
        });
        self.cancelled.store(false, Ordering::SeqCst);
        info!(
            "Mock device: scan started ({}x{} px)",
            params.pixels_per_line,
            params.lines.unwrap_or(0)
        );
        Ok(())
    }

    fn parameters(&self) -> Result<ScanParameters, DeviceStatus> {
        let state = self.state.lock();
        match &state.scan {
            Some(scan) => Ok(scan.params),
            None => Ok(Self::negotiate(&state.options)),
        }
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, DeviceStatus> {
        let delay = *self.line_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DeviceStatus::Cancelled);
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let scan = state.scan.as_mut().ok_or(DeviceStatus::Invalid)?;
        let bytes_per_line = scan.params.bytes_per_line.max(1);
        let line = scan.sent_bytes / bytes_per_line;

        if let Some((fail_line, status)) = state.line_failure {
            if fail_line == line {
                return Err(status);
            }
        }
        if scan.sent_bytes >= scan.total_bytes {
            return Err(DeviceStatus::Eof);
        }

        let count = buffer.len().min(scan.total_bytes - scan.sent_bytes);
        for (offset, byte) in buffer[..count].iter_mut().enumerate() {
            let position = scan.sent_bytes + offset;
            let row = position / bytes_per_line;
            let column = position % bytes_per_line;
            *byte = ((row + column) % 256) as u8;
        }
        scan.sent_bytes += count;
        Ok(count)
    }

    fn cancel(&self) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.scan.take().is_some() {
            debug!("Mock device: acquisition cancelled");
        }
    }
}

// =============================================================================
// Option builders
// =============================================================================

fn group(title: &str) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: String::new(),
            title: title.to_string(),
            description: String::new(),
            value_type: ValueType::Group,
            unit: Unit::None,
            size: 0,
            capabilities: Capabilities::empty(),
            constraint: RawConstraint::None,
        },
        value: WireValue::None,
    }
}

fn string_option(name: &str, title: &str, choices: &[&str], value: &str) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: name.to_string(),
            title: title.to_string(),
            description: String::new(),
            value_type: ValueType::String,
            unit: Unit::None,
            size: STRING_SIZE,
            capabilities: Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT,
            constraint: RawConstraint::StringList(choices.iter().map(|c| c.to_string()).collect()),
        },
        value: WireValue::Text(value.to_string()),
    }
}

fn bool_option(name: &str, title: &str, capabilities: Capabilities, value: bool) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: name.to_string(),
            title: title.to_string(),
            description: String::new(),
            value_type: ValueType::Bool,
            unit: Unit::None,
            size: WORD_SIZE,
            capabilities,
            constraint: RawConstraint::None,
        },
        value: WireValue::Words(vec![Word::from(value)]),
    }
}

fn int_option(
    name: &str,
    title: &str,
    unit: Unit,
    capabilities: Capabilities,
    (min, max, quant): (Word, Word, Word),
    value: Word,
) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: name.to_string(),
            title: title.to_string(),
            description: String::new(),
            value_type: ValueType::Int,
            unit,
            size: WORD_SIZE,
            capabilities,
            constraint: RawConstraint::Range { min, max, quant },
        },
        value: WireValue::Words(vec![value]),
    }
}

fn fixed_range(max_mm: f64) -> RawConstraint {
    RawConstraint::Range {
        min: 0,
        max: fix(max_mm),
        quant: 0,
    }
}

fn fixed_option(name: &str, title: &str, max_mm: f64, value: f64) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: name.to_string(),
            title: title.to_string(),
            description: String::new(),
            value_type: ValueType::Fixed,
            unit: Unit::Millimeter,
            size: WORD_SIZE,
            capabilities: Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT,
            constraint: fixed_range(max_mm),
        },
        value: WireValue::Words(vec![fix(value)]),
    }
}

/// Integer option with a word-list constraint, e.g. a per-axis resolution.
pub fn word_list_option(name: &str, unit: Unit, words: &[Word], value: Word) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: name.to_string(),
            title: name.to_string(),
            description: String::new(),
            value_type: ValueType::Int,
            unit,
            size: WORD_SIZE,
            capabilities: Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT,
            constraint: RawConstraint::WordList(words.to_vec()),
        },
        value: WireValue::Words(vec![value]),
    }
}

/// Integer option with a continuous range, e.g. a pixel-unit scan-area edge.
pub fn range_option(name: &str, unit: Unit, min: Word, max: Word, value: Word) -> MockOption {
    MockOption {
        desc: OptionDescriptor {
            name: name.to_string(),
            title: name.to_string(),
            description: String::new(),
            value_type: ValueType::Int,
            unit,
            size: WORD_SIZE,
            capabilities: Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT,
            constraint: RawConstraint::Range {
                min,
                max,
                quant: 0,
            },
        },
        value: WireValue::Words(vec![value]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(device: &MockDevice, name: &str) -> usize {
        (1..=device.option_count())
            .find(|i| device.option_descriptor(*i).is_some_and(|d| d.name == name))
            .unwrap()
    }

    #[test]
    fn test_quantized_range_snaps_and_reports_inexact() {
        let device = MockDevice::flatbed();
        let index = index_of(&device, "brightness");

        let info = device.set_value(index, &WireValue::Words(vec![12])).unwrap();
        assert!(info.contains(SetInfo::INEXACT));
        assert_eq!(device.wire_value("brightness"), Some(WireValue::Words(vec![10])));
    }

    #[test]
    fn test_source_change_requests_reload() {
        let device = MockDevice::flatbed();
        let index = index_of(&device, "source");

        let info = device
            .set_value(index, &WireValue::Text("ADF".into()))
            .unwrap();
        assert!(info.contains(SetInfo::RELOAD_OPTIONS));
        let br_y = device.option_descriptor(index_of(&device, "br-y")).unwrap();
        assert_eq!(
            br_y.constraint,
            RawConstraint::Range {
                min: 0,
                max: fix(355.6),
                quant: 0
            }
        );
    }

    #[test]
    fn test_writes_rejected_while_scanning() {
        let device = MockDevice::flatbed();
        let index = index_of(&device, "resolution");
        device.start().unwrap();
        assert_eq!(
            device.set_value(index, &WireValue::Words(vec![150])),
            Err(DeviceStatus::DeviceBusy)
        );
        device.cancel();
        assert!(device.set_value(index, &WireValue::Words(vec![150])).is_ok());
    }

    #[test]
    fn test_read_until_eof() {
        let device = MockDevice::flatbed();
        device.replace_option(fixed_option("br-x", "Bottom-right x", 215.9, 25.4));
        device.replace_option(fixed_option("br-y", "Bottom-right y", 297.18, 25.4));
        device.replace_constraint("resolution", RawConstraint::WordList(vec![10]));
        device
            .set_value(index_of(&device, "resolution"), &WireValue::Words(vec![10]))
            .unwrap();
        device.start().unwrap();

        let params = device.parameters().unwrap();
        assert_eq!(params.pixels_per_line, 10);
        assert_eq!(params.lines, Some(10));
        assert_eq!(params.bytes_per_line, 30);

        let mut buffer = vec![0u8; params.bytes_per_line];
        let mut lines = 0;
        while device.read(&mut buffer).is_ok() {
            assert_eq!(buffer[0], lines as u8);
            lines += 1;
        }
        assert_eq!(lines, 10);
        assert_eq!(device.read(&mut buffer), Err(DeviceStatus::Eof));
    }
}
