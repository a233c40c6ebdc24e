//! Device-control protocol boundary.
//!
//! A scanner exposes a flat, 1-based array of option descriptors, get/set
//! access to option values by index, and a start/read/cancel acquisition
//! cycle. This module holds the raw protocol types and the two traits a
//! backend implements:
//!
//! - [`ScannerBackend`] - library lifecycle, device enumeration, `open`.
//! - [`ScannerDevice`] - one opened device handle.
//!
//! Everything here is wire-level: fixed-point values are still scaled
//! integers, capability masks are still bit sets. The option model
//! (`crate::option`) is the only consumer that turns them into semantic
//! values.
//!
//! Two backends ship with the crate: [`mock::MockBackend`] (always built, a
//! simulated flatbed) and `sane::SaneBackend` (native library, behind the
//! `sane_hardware` feature).

pub mod mock;
#[cfg(feature = "sane_hardware")]
pub mod sane;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AppResult;

/// One protocol word. Booleans, integers and fixed-point values all travel
/// as words.
pub type Word = i32;

/// Fixed-point values are words scaled by `1 << FIXED_SCALE_SHIFT`.
pub const FIXED_SCALE_SHIFT: u32 = 16;

/// Device type-class reported by loopback/test backends; never listed.
pub const VIRTUAL_DEVICE_TYPE: &str = "virtual device";

/// Size in bytes of one protocol word.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Convert a scaled fixed-point word to floating point.
pub fn unfix(word: Word) -> f64 {
    f64::from(word) / f64::from(1u32 << FIXED_SCALE_SHIFT)
}

/// Convert a floating-point value to a scaled fixed-point word.
pub fn fix(value: f64) -> Word {
    (value * f64::from(1u32 << FIXED_SCALE_SHIFT)).round() as Word
}

// =============================================================================
// Status codes
// =============================================================================

/// Status returned by a device-control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Operation completed normally.
    Good,
    /// Operation is not supported.
    Unsupported,
    /// Operation was cancelled.
    Cancelled,
    /// Device is busy.
    DeviceBusy,
    /// Data is invalid.
    Invalid,
    /// No more data available.
    Eof,
    /// Document feeder jammed.
    Jammed,
    /// Document feeder out of documents.
    NoDocs,
    /// Scanner cover is open.
    CoverOpen,
    /// Error during device I/O.
    IoError,
    /// Out of memory.
    NoMem,
    /// Access to resource has been denied.
    AccessDenied,
}

impl DeviceStatus {
    /// Map a protocol status code. Unknown codes map to `Invalid`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Good,
            1 => Self::Unsupported,
            2 => Self::Cancelled,
            3 => Self::DeviceBusy,
            5 => Self::Eof,
            6 => Self::Jammed,
            7 => Self::NoDocs,
            8 => Self::CoverOpen,
            9 => Self::IoError,
            10 => Self::NoMem,
            11 => Self::AccessDenied,
            _ => Self::Invalid,
        }
    }

    /// Protocol's textual description of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "Success",
            Self::Unsupported => "Operation not supported",
            Self::Cancelled => "Operation was cancelled",
            Self::DeviceBusy => "Device busy",
            Self::Invalid => "Invalid argument",
            Self::Eof => "End of file reached",
            Self::Jammed => "Document feeder jammed",
            Self::NoDocs => "Document feeder out of documents",
            Self::CoverOpen => "Scanner cover is open",
            Self::IoError => "Error during device I/O",
            Self::NoMem => "Out of memory",
            Self::AccessDenied => "Access to resource has been denied",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Protocol value type of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// Boolean word(s).
    Bool,
    /// Integer word(s).
    Int,
    /// Fixed-point word(s).
    Fixed,
    /// NUL-terminated string buffer.
    String,
    /// Action without a value.
    Button,
    /// Group header, no value.
    Group,
}

impl ValueType {
    /// Map a protocol type code. Unknown codes are treated as groups so they
    /// never carry a value.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Bool,
            1 => Self::Int,
            2 => Self::Fixed,
            3 => Self::String,
            4 => Self::Button,
            _ => Self::Group,
        }
    }
}

/// Physical unit of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Unit {
    /// Unitless.
    #[default]
    None,
    /// Pixels.
    Pixel,
    /// Bits.
    Bit,
    /// Millimeters.
    Millimeter,
    /// Dots per inch.
    Dpi,
    /// Percent.
    Percent,
    /// Microseconds.
    Microsecond,
}

impl Unit {
    /// Map a protocol unit code. Unknown codes are unitless.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Pixel,
            2 => Self::Bit,
            3 => Self::Millimeter,
            4 => Self::Dpi,
            5 => Self::Percent,
            6 => Self::Microsecond,
            _ => Self::None,
        }
    }

    /// Display suffix for UI labels. Empty for unitless options.
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Pixel => "px",
            Self::Bit => "bits",
            Self::Millimeter => "mm",
            Self::Dpi => "dpi",
            Self::Percent => "%",
            Self::Microsecond => "µs",
        }
    }
}

bitflags! {
    /// Capability bits of an option descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Settable through software.
        const SOFT_SELECT = 1 << 0;
        /// Settable only through a hardware switch.
        const HARD_SELECT = 1 << 1;
        /// Readable through software.
        const SOFT_DETECT = 1 << 2;
        /// Emulated by the backend.
        const EMULATED = 1 << 3;
        /// Backend can pick the value automatically.
        const AUTOMATIC = 1 << 4;
        /// Currently inactive.
        const INACTIVE = 1 << 5;
        /// Advanced option, hidden by default.
        const ADVANCED = 1 << 6;
    }
}

bitflags! {
    /// Side-effect report returned by an option write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetInfo: u32 {
        /// The value was snapped to a nearby legal value.
        const INEXACT = 1 << 0;
        /// Other options may have changed validity, constraint or value.
        const RELOAD_OPTIONS = 1 << 1;
        /// Scan parameters may have changed.
        const RELOAD_PARAMS = 1 << 2;
    }
}

/// Raw constraint as reported by the device.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RawConstraint {
    /// Any value.
    #[default]
    None,
    /// Inclusive range with quantization step (0 = continuous).
    Range {
        /// Minimum word.
        min: Word,
        /// Maximum word.
        max: Word,
        /// Quantization word.
        quant: Word,
    },
    /// Ordered list of allowed words.
    WordList(Vec<Word>),
    /// Ordered list of allowed strings.
    StringList(Vec<String>),
}

/// Immutable per-option metadata reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionDescriptor {
    /// Name used for registry lookup. Empty for groups.
    pub name: String,
    /// Display title.
    pub title: String,
    /// Display description.
    pub description: String,
    /// Protocol value type.
    pub value_type: ValueType,
    /// Unit of the value.
    pub unit: Unit,
    /// Value size in bytes (word count * 4 for lists, buffer size for strings).
    pub size: usize,
    /// Capability bits.
    pub capabilities: Capabilities,
    /// Allowed-value shape.
    pub constraint: RawConstraint,
}

/// Option value in wire form.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// One or more words (bool, int, fixed).
    Words(Vec<Word>),
    /// String value without the NUL terminator.
    Text(String),
    /// No value (buttons, groups).
    None,
}

// =============================================================================
// Scan parameters
// =============================================================================

/// Frame format negotiated at scan start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Single channel.
    Gray,
    /// Interleaved red/green/blue.
    Rgb,
    /// Red channel only.
    Red,
    /// Green channel only.
    Green,
    /// Blue channel only.
    Blue,
}

impl FrameFormat {
    /// Map a protocol frame code. Unknown codes are treated as gray.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Rgb,
            2 => Self::Red,
            3 => Self::Green,
            4 => Self::Blue,
            _ => Self::Gray,
        }
    }

    /// Samples per pixel in one line of this frame.
    pub fn channels(&self) -> usize {
        match self {
            Self::Rgb => 3,
            _ => 1,
        }
    }
}

/// Parameters negotiated by the device after `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Frame format.
    pub format: FrameFormat,
    /// Whether this is the last frame of the image.
    pub last_frame: bool,
    /// Bytes in one scan line.
    pub bytes_per_line: usize,
    /// Pixels in one scan line.
    pub pixels_per_line: usize,
    /// Number of lines, `None` when the device cannot tell in advance.
    pub lines: Option<usize>,
    /// Bits per sample.
    pub depth: u32,
}

// =============================================================================
// Devices
// =============================================================================

/// Snapshot of one enumerated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique identifier passed to `open`.
    pub name: String,
    /// Vendor string.
    pub vendor: String,
    /// Model string.
    pub model: String,
    /// Type-class string (e.g. "flatbed scanner").
    pub device_type: String,
}

impl DeviceInfo {
    /// Vendor and model joined for display.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.vendor, self.model)
    }
}

/// Library-level entry point of a device-control backend.
pub trait ScannerBackend: Send + Sync {
    /// Initialize the backend library. Calling it twice is harmless.
    fn init(&self) -> AppResult<()>;

    /// Release the backend library. Calling it while uninitialized is harmless.
    fn exit(&self);

    /// List attached devices, unfiltered.
    fn devices(&self, local_only: bool) -> AppResult<Vec<DeviceInfo>>;

    /// Open the device with the given unique name.
    fn open(&self, name: &str) -> AppResult<Arc<dyn ScannerDevice>>;
}

/// One opened device.
///
/// All calls are synchronous and may block on device I/O. The handle is shared
/// between the controlling context and the scan worker; the scanner's
/// Idle/Scanning gating ensures only one of them issues I/O at a time, except
/// for [`ScannerDevice::cancel`], which must be callable while a `read` is
/// blocked on another thread.
pub trait ScannerDevice: Send + Sync {
    /// Descriptor at the 1-based protocol index, `None` past the last option.
    fn option_descriptor(&self, index: usize) -> Option<OptionDescriptor>;

    /// Read the current value of the option at `index`.
    fn get_value(&self, index: usize) -> Result<WireValue, DeviceStatus>;

    /// Write the option at `index`, reporting side effects.
    fn set_value(&self, index: usize, value: &WireValue) -> Result<SetInfo, DeviceStatus>;

    /// Start acquiring a frame.
    fn start(&self) -> Result<(), DeviceStatus>;

    /// Parameters of the frame being acquired.
    fn parameters(&self) -> Result<ScanParameters, DeviceStatus>;

    /// Read up to `buffer.len()` bytes. Returns `Err(Eof)` at end of frame and
    /// `Err(Cancelled)` after an abort.
    fn read(&self, buffer: &mut [u8]) -> Result<usize, DeviceStatus>;

    /// Abort the current acquisition. Also ends a completed one.
    fn cancel(&self);
}

/// Enumerate devices, dropping loopback/test devices.
///
/// The backend is re-initialized first so newly attached devices show up.
pub fn enumerate_devices(
    backend: &dyn ScannerBackend,
    local_only: bool,
) -> AppResult<Vec<DeviceInfo>> {
    backend.exit();
    backend.init()?;

    let devices: Vec<DeviceInfo> = backend
        .devices(local_only)?
        .into_iter()
        .filter(|device| {
            let keep = device.device_type != VIRTUAL_DEVICE_TYPE;
            if !keep {
                debug!("Skipping virtual device '{}'", device.name);
            }
            keep
        })
        .collect();

    info!("Found {} scanner device(s)", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockBackend;

    #[test]
    fn test_fixed_point_conversion() {
        assert_eq!(fix(1.0), 65536);
        assert_eq!(unfix(65536 * 300), 300.0);
        assert!((unfix(fix(215.9)) - 215.9).abs() < 1e-4);
        assert_eq!(fix(-2.5), -163840);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(DeviceStatus::from_code(5), DeviceStatus::Eof);
        assert_eq!(DeviceStatus::from_code(99), DeviceStatus::Invalid);
        assert_eq!(DeviceStatus::Cancelled.to_string(), "Operation was cancelled");
    }

    #[test]
    fn test_enumeration_filters_virtual_devices() {
        let backend = MockBackend::new();
        backend.add_device(DeviceInfo {
            name: "test:0".into(),
            vendor: "Noname".into(),
            model: "frontend-tester".into(),
            device_type: VIRTUAL_DEVICE_TYPE.into(),
        });

        let devices = enumerate_devices(&backend, true).unwrap();
        assert!(devices.iter().all(|d| d.device_type != VIRTUAL_DEVICE_TYPE));
        assert!(devices.iter().any(|d| d.name == MockBackend::FLATBED_NAME));
    }

    #[test]
    fn test_unit_labels() {
        assert_eq!(Unit::Dpi.label(), "dpi");
        assert_eq!(Unit::from_code(3), Unit::Millimeter);
        assert_eq!(Unit::None.label(), "");
    }
}
