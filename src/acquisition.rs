//! Acquisition Pipeline
//!
//! Scan lifecycle on top of [`Scanner`]: start, parameter negotiation,
//! line reads, cancel. Also the derived geometry the pipeline needs from the
//! option model (combined resolution, scan area, uniform resolutions,
//! maximum scan area) and the preview bookkeeping.
//!
//! Scan-area values are always physical millimeters at this level. Devices
//! that describe the area in pixels are converted with the current
//! resolution, in both directions.
//!
//! ```text
//!   Idle ──start(preview)──▶ Scanning ──read_scan_line()*──▶ end of data
//!    ▲                          │
//!    └──────── cancel() ◀───────┘   (restore preview, flush deferred writes)
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::{DeviceStatus, FrameFormat, ScanParameters, Unit};
use crate::error::{AppResult, ScanError};
use crate::option::{OptionValue, Range};
use crate::registry::OptionRegistry;
use crate::scanner::{Scanner, ScannerState};

/// Millimeters per inch.
pub const MM_PER_INCH: f64 = 25.4;

/// Well-known option names.
pub mod names {
    /// Preview flag.
    pub const PREVIEW: &str = "preview";
    /// Combined resolution.
    pub const RESOLUTION: &str = "resolution";
    /// Horizontal resolution.
    pub const X_RESOLUTION: &str = "x-resolution";
    /// Vertical resolution.
    pub const Y_RESOLUTION: &str = "y-resolution";
    /// Left edge of the scan area.
    pub const TOP_LEFT_X: &str = "tl-x";
    /// Top edge of the scan area.
    pub const TOP_LEFT_Y: &str = "tl-y";
    /// Right edge of the scan area.
    pub const BOTTOM_RIGHT_X: &str = "br-x";
    /// Bottom edge of the scan area.
    pub const BOTTOM_RIGHT_Y: &str = "br-y";
}

/// Resolution in dots per inch on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Horizontal DPI.
    pub x: f64,
    /// Vertical DPI.
    pub y: f64,
}

impl Resolution {
    /// Same DPI on both axes.
    pub fn uniform(dpi: f64) -> Self {
        Self { x: dpi, y: dpi }
    }
}

/// Scan area in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Left edge.
    pub left: f64,
    /// Top edge.
    pub top: f64,
    /// Right edge.
    pub right: f64,
    /// Bottom edge.
    pub bottom: f64,
}

impl Bounds {
    /// Width of the area.
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    /// Height of the area.
    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }
}

/// Sample layout of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// One bit per pixel.
    Mono,
    /// 8-bit gray.
    Gray8,
    /// 16-bit gray.
    Gray16,
    /// 8 bits per channel, interleaved RGB.
    Rgb24,
    /// 16 bits per channel, interleaved RGB.
    Rgb48,
}

impl PixelFormat {
    /// Layout produced by a frame of `format` with `depth` bits per sample.
    /// Single-channel frames are treated as gray.
    pub fn from_frame(format: FrameFormat, depth: u32) -> Self {
        match (format.channels(), depth) {
            (_, 1) => Self::Mono,
            (3, 16) => Self::Rgb48,
            (3, _) => Self::Rgb24,
            (_, 16) => Self::Gray16,
            _ => Self::Gray8,
        }
    }
}

/// Image buffer allocated at scan start.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanImage {
    /// Pixels per line.
    pub width: usize,
    /// Lines. Grows as lines arrive when the device did not announce it.
    pub height: usize,
    /// Sample layout.
    pub format: PixelFormat,
    /// Bytes per line.
    pub bytes_per_line: usize,
    /// Horizontal dots per meter.
    pub dots_per_meter_x: u32,
    /// Vertical dots per meter.
    pub dots_per_meter_y: u32,
    /// Raw line data, `bytes_per_line * height` bytes.
    pub data: Vec<u8>,
}

fn dots_per_meter(dpi: f64) -> u32 {
    (dpi * 1000.0 / MM_PER_INCH).round().max(0.0) as u32
}

impl ScanImage {
    /// Zeroed buffer for a frame with `params`, tagged with `resolution`.
    pub fn new(params: &ScanParameters, resolution: Resolution) -> Self {
        let height = params.lines.unwrap_or(0);
        Self {
            width: params.pixels_per_line,
            height,
            format: PixelFormat::from_frame(params.format, params.depth),
            bytes_per_line: params.bytes_per_line,
            dots_per_meter_x: dots_per_meter(resolution.x),
            dots_per_meter_y: dots_per_meter(resolution.y),
            data: vec![0; params.bytes_per_line * height],
        }
    }

    /// Copy `line` into row `index`, growing the buffer if needed. Extra
    /// bytes beyond one line are dropped.
    pub fn write_line(&mut self, index: usize, line: &[u8]) {
        if index >= self.height {
            self.height = index + 1;
            self.data.resize(self.bytes_per_line * self.height, 0);
        }
        let start = index * self.bytes_per_line;
        let len = line.len().min(self.bytes_per_line);
        self.data[start..start + len].copy_from_slice(&line[..len]);
    }

    /// Row `index`.
    pub fn line(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.bytes_per_line)?;
        self.data.get(start..start + self.bytes_per_line)
    }
}

/// Result of one [`Scanner::read_scan_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanLine {
    /// One line of data. The last line may be short.
    Line {
        /// 0-based line number.
        index: usize,
        /// Line bytes.
        data: Vec<u8>,
    },
    /// The device has no more data.
    EndOfData,
    /// The device aborted the frame.
    Cancelled,
}

#[derive(Debug, Clone)]
struct PreviewRestore {
    preview: Option<OptionValue>,
    resolution: Option<Resolution>,
    bounds: Option<Bounds>,
}

/// State of one open scan. `params` is `None` while the device is still
/// starting.
#[derive(Debug)]
pub(crate) struct ScanSession {
    params: Option<ScanParameters>,
    next_line: usize,
    preview: Option<PreviewRestore>,
}

impl ScanSession {
    /// Whether this session switched `name` for a preview and will put it
    /// back when it ends.
    pub(crate) fn overrides(&self, name: &str) -> bool {
        self.preview.is_some() && PREVIEW_MANAGED.iter().any(|managed| *managed == name)
    }
}

/// Options `enter_preview` may change.
const PREVIEW_MANAGED: [&str; 8] = [
    names::PREVIEW,
    names::RESOLUTION,
    names::X_RESOLUTION,
    names::Y_RESOLUTION,
    names::TOP_LEFT_X,
    names::TOP_LEFT_Y,
    names::BOTTOM_RIGHT_X,
    names::BOTTOM_RIGHT_Y,
];

// =============================================================================
// Geometry derived from the option model
// =============================================================================

fn number(registry: &OptionRegistry, name: &str) -> Option<f64> {
    registry.find(name).and_then(|option| option.value().as_f64())
}

fn read_resolution(registry: &OptionRegistry) -> Option<Resolution> {
    let base = number(registry, names::RESOLUTION);
    let x = number(registry, names::X_RESOLUTION).or(base)?;
    let y = number(registry, names::Y_RESOLUTION).or(base)?;
    Some(Resolution { x, y })
}

fn is_pixel_unit(registry: &OptionRegistry, name: &str) -> bool {
    registry
        .find(name)
        .is_some_and(|option| option.unit() == Unit::Pixel)
}

fn to_mm(pixels: f64, dpi: f64) -> f64 {
    if dpi > 0.0 {
        pixels / dpi * MM_PER_INCH
    } else {
        pixels
    }
}

fn to_pixels(mm: f64, dpi: f64) -> f64 {
    (mm / MM_PER_INCH * dpi).round()
}

/// Convert pixel-unit coordinates to millimeters at the current resolution.
fn physical(registry: &OptionRegistry, raw: Bounds) -> Bounds {
    if !is_pixel_unit(registry, names::BOTTOM_RIGHT_X) {
        return raw;
    }
    let dpi = read_resolution(registry).unwrap_or(Resolution::uniform(0.0));
    Bounds {
        left: to_mm(raw.left, dpi.x),
        top: to_mm(raw.top, dpi.y),
        right: to_mm(raw.right, dpi.x),
        bottom: to_mm(raw.bottom, dpi.y),
    }
}

fn read_bounds(registry: &OptionRegistry) -> Option<Bounds> {
    let raw = Bounds {
        left: number(registry, names::TOP_LEFT_X)?,
        top: number(registry, names::TOP_LEFT_Y)?,
        right: number(registry, names::BOTTOM_RIGHT_X)?,
        bottom: number(registry, names::BOTTOM_RIGHT_Y)?,
    };
    Some(physical(registry, raw))
}

fn read_maximum_bounds(registry: &OptionRegistry) -> Option<Bounds> {
    let (min_x, max_x) = registry.find(names::BOTTOM_RIGHT_X)?.constraint().min_max()?;
    let (min_y, max_y) = registry.find(names::BOTTOM_RIGHT_Y)?.constraint().min_max()?;
    let raw = Bounds {
        left: min_x,
        top: min_y,
        right: max_x,
        bottom: max_y,
    };
    Some(physical(registry, raw))
}

fn has_pending(registry: &OptionRegistry, name: &str) -> bool {
    registry
        .find(name)
        .is_some_and(|option| option.has_unapplied_value())
}

fn allowed_resolutions(registry: &OptionRegistry, name: &str) -> Option<Vec<f64>> {
    registry
        .find(name)
        .map(|option| option.constraint().numeric_values())
}

fn read_uniform_resolutions(registry: &OptionRegistry) -> Vec<f64> {
    let base = allowed_resolutions(registry, names::RESOLUTION).unwrap_or_default();
    let xs = allowed_resolutions(registry, names::X_RESOLUTION).unwrap_or_else(|| base.clone());
    let ys = allowed_resolutions(registry, names::Y_RESOLUTION).unwrap_or(base);

    let mut uniform: Vec<f64> = xs.iter().copied().filter(|x| ys.contains(x)).collect();
    if uniform.is_empty() {
        // Never leave the caller without a resolution to pick.
        uniform.extend(xs.iter().copied().reduce(f64::min));
    }
    uniform.sort_by(f64::total_cmp);
    uniform.dedup();
    uniform
}

// =============================================================================
// Pipeline
// =============================================================================

impl Scanner {
    /// Current resolution. Per-axis options override the combined one.
    pub fn resolution(&self) -> Option<Resolution> {
        read_resolution(&self.state.lock().registry)
    }

    /// Write the combined resolution as `min(x, y)` plus the per-axis
    /// options the device has.
    pub fn set_resolution(&self, resolution: Resolution) -> AppResult<()> {
        let mut state = self.state.lock();
        self.write_resolution(&mut state, resolution)
    }

    /// Resolutions usable on both axes, ascending and never empty when the
    /// device constrains its resolution.
    pub fn uniform_resolutions(&self) -> Vec<f64> {
        read_uniform_resolutions(&self.state.lock().registry)
    }

    /// Current scan area in millimeters.
    pub fn bounds(&self) -> Option<Bounds> {
        read_bounds(&self.state.lock().registry)
    }

    /// Set the scan area, given in millimeters.
    pub fn set_bounds(&self, bounds: Bounds) -> AppResult<()> {
        let mut state = self.state.lock();
        self.write_bounds(&mut state, bounds)
    }

    /// Largest scan area in millimeters, from the bottom-right constraints.
    pub fn maximum_bounds(&self) -> Option<Bounds> {
        read_maximum_bounds(&self.state.lock().registry)
    }

    /// Continuous range of the combined resolution, if it has one.
    pub fn resolution_range(&self) -> Option<Range> {
        self.state
            .lock()
            .registry
            .find(names::RESOLUTION)
            .and_then(|option| option.constraint().range())
    }

    fn write_resolution(&self, state: &mut ScannerState, resolution: Resolution) -> AppResult<()> {
        let combined = resolution.x.min(resolution.y);
        self.write_option(state, names::RESOLUTION, OptionValue::Fixed(combined))?;
        self.write_option(state, names::X_RESOLUTION, OptionValue::Fixed(resolution.x))?;
        self.write_option(state, names::Y_RESOLUTION, OptionValue::Fixed(resolution.y))?;
        Ok(())
    }

    fn write_bounds(&self, state: &mut ScannerState, bounds: Bounds) -> AppResult<()> {
        let raw = if is_pixel_unit(&state.registry, names::BOTTOM_RIGHT_X) {
            let dpi = read_resolution(&state.registry).unwrap_or(Resolution::uniform(0.0));
            Bounds {
                left: to_pixels(bounds.left, dpi.x),
                top: to_pixels(bounds.top, dpi.y),
                right: to_pixels(bounds.right, dpi.x),
                bottom: to_pixels(bounds.bottom, dpi.y),
            }
        } else {
            bounds
        };
        for (name, value) in [
            (names::TOP_LEFT_X, raw.left),
            (names::TOP_LEFT_Y, raw.top),
            (names::BOTTOM_RIGHT_X, raw.right),
            (names::BOTTOM_RIGHT_Y, raw.bottom),
        ] {
            self.write_option(state, name, OptionValue::Fixed(value))?;
        }
        Ok(())
    }

    fn enter_preview(&self, state: &mut ScannerState) -> PreviewRestore {
        let saved = PreviewRestore {
            preview: state
                .registry
                .find(names::PREVIEW)
                .map(|option| option.value().clone()),
            resolution: read_resolution(&state.registry),
            bounds: read_bounds(&state.registry),
        };

        if let Some(&lowest) = read_uniform_resolutions(&state.registry).first() {
            if let Err(e) = self.write_resolution(state, Resolution::uniform(lowest)) {
                warn!("Could not lower resolution for preview: {}", e);
            }
        }
        // Pixel-unit areas depend on the resolution just written.
        if let Some(maximum) = read_maximum_bounds(&state.registry) {
            if let Err(e) = self.write_bounds(state, maximum) {
                warn!("Could not maximize scan area for preview: {}", e);
            }
        }
        if let Err(e) = self.write_option(state, names::PREVIEW, OptionValue::Bool(true)) {
            warn!("Could not enable preview option: {}", e);
        }
        debug!("Preview mode entered, saved {:?}", saved);
        saved
    }

    /// Put back what `enter_preview` changed. Options edited during the scan
    /// keep the edit; the deferred flush applies it.
    fn restore_preview(&self, state: &mut ScannerState, saved: &PreviewRestore) {
        if let Some(preview) = &saved.preview {
            if !has_pending(&state.registry, names::PREVIEW) {
                self.restore_option(state, names::PREVIEW, preview.clone());
            }
        }
        if let Some(resolution) = saved.resolution {
            let values = [
                (names::RESOLUTION, resolution.x.min(resolution.y)),
                (names::X_RESOLUTION, resolution.x),
                (names::Y_RESOLUTION, resolution.y),
            ];
            for (name, value) in values {
                if !has_pending(&state.registry, name) {
                    self.restore_option(state, name, OptionValue::Fixed(value));
                }
            }
        }
        if let Some(bounds) = saved.bounds {
            let edited = [
                names::TOP_LEFT_X,
                names::TOP_LEFT_Y,
                names::BOTTOM_RIGHT_X,
                names::BOTTOM_RIGHT_Y,
            ]
            .iter()
            .any(|name| has_pending(&state.registry, name));
            if !edited {
                if let Err(e) = self.write_bounds(state, bounds) {
                    warn!("Could not restore scan area after preview: {}", e);
                }
            }
        }
        debug!("Preview settings restored");
    }

    fn restore_option(&self, state: &mut ScannerState, name: &str, value: OptionValue) {
        if let Err(e) = self.write_option(state, name, value) {
            warn!("Could not restore '{}' after preview: {}", name, e);
        }
    }

    /// Start a scan and allocate the image buffer for it.
    ///
    /// With `preview`, resolution and scan area are first switched to the
    /// lowest uniform resolution and the full area; they are restored by
    /// [`Scanner::cancel`], or right away if the start fails.
    ///
    /// The scanner counts as scanning from the moment this is called, and the
    /// state lock is released while the device starts, so option writes from
    /// other threads are deferred instead of waiting on the device.
    pub fn start(&self, preview: bool) -> AppResult<ScanImage> {
        {
            let mut state = self.state.lock();
            if state.session.is_some() {
                return Err(ScanError::AlreadyScanning);
            }
            let saved = preview.then(|| self.enter_preview(&mut state));
            state.session = Some(ScanSession {
                params: None,
                next_line: 0,
                preview: saved,
            });
        }

        let negotiated = self
            .device
            .start()
            .map_err(|status| ScanError::device("starting scan", status))
            .and_then(|()| {
                self.device.parameters().map_err(|status| {
                    self.device.cancel();
                    ScanError::device("getting scan parameters", status)
                })
            });

        let mut state = self.state.lock();
        let params = match negotiated {
            Ok(params) => params,
            Err(e) => {
                if let Some(session) = state.session.take() {
                    if let Some(saved) = &session.preview {
                        self.restore_preview(&mut state, saved);
                    }
                    self.apply_unapplied(&mut state);
                }
                return Err(e);
            }
        };

        let resolution =
            read_resolution(&state.registry).unwrap_or(Resolution::uniform(0.0));
        let Some(session) = state.session.as_mut() else {
            // Cancelled from another thread while the device was starting;
            // that cancel already restored and flushed.
            self.device.cancel();
            return Err(ScanError::device("starting scan", DeviceStatus::Cancelled));
        };
        session.params = Some(params);
        let image = ScanImage::new(&params, resolution);

        info!(
            "Scan started on '{}': {}x{} px, {} bytes/line, {:?}{}",
            self.name(),
            image.width,
            image.height,
            image.bytes_per_line,
            image.format,
            if preview { " (preview)" } else { "" }
        );
        Ok(image)
    }

    /// Parameters of the running scan.
    pub fn scan_parameters(&self) -> Option<ScanParameters> {
        self.state
            .lock()
            .session
            .as_ref()
            .and_then(|session| session.params)
    }

    /// Read exactly one line.
    ///
    /// Short device reads are accumulated; only a frame that ends mid-line
    /// produces a short line. End of data and device aborts are reported as
    /// [`ScanLine::EndOfData`] and [`ScanLine::Cancelled`], never as errors.
    pub fn read_scan_line(&self) -> AppResult<ScanLine> {
        let (bytes_per_line, index) = {
            let state = self.state.lock();
            let session = state.session.as_ref().ok_or(ScanError::NotScanning)?;
            let params = session.params.ok_or(ScanError::NotScanning)?;
            (params.bytes_per_line, session.next_line)
        };
        if bytes_per_line == 0 {
            debug!("Device negotiated empty lines, nothing to read");
            return Ok(ScanLine::EndOfData);
        }

        let mut line = vec![0u8; bytes_per_line];
        let mut filled = 0;
        let mut end = None;
        while filled < bytes_per_line {
            match self.device.read(&mut line[filled..]) {
                Ok(0) => {
                    end = Some(ScanLine::EndOfData);
                    break;
                }
                Ok(n) => filled += n,
                Err(DeviceStatus::Eof) => {
                    end = Some(ScanLine::EndOfData);
                    break;
                }
                Err(DeviceStatus::Cancelled) => {
                    end = Some(ScanLine::Cancelled);
                    break;
                }
                Err(status) => return Err(ScanError::device("reading line", status)),
            }
        }

        if filled == 0 {
            if let Some(end) = end {
                return Ok(end);
            }
        }
        line.truncate(filled);

        if let Some(session) = self.state.lock().session.as_mut() {
            session.next_line = index + 1;
        }
        Ok(ScanLine::Line { index, data: line })
    }

    /// Abort the device and end the session.
    ///
    /// The device abort is unconditional. When a session was open, preview
    /// settings are restored and every deferred option value is applied
    /// before this returns. Also ends a scan that reached end of data.
    pub fn cancel(&self) -> AppResult<()> {
        self.device.cancel();

        let mut state = self.state.lock();
        let session = state.session.take().ok_or(ScanError::NotScanning)?;
        if let Some(saved) = &session.preview {
            self.restore_preview(&mut state, saved);
        }
        let applied = self.apply_unapplied(&mut state);
        info!(
            "Scan on '{}' ended after {} line(s), {} deferred value(s) applied",
            self.name(),
            session.next_line,
            applied
        );
        Ok(())
    }

    /// Ask the device to abort without touching the session. Safe to call
    /// from another thread while a read is blocked.
    pub fn abort(&self) {
        debug!("Aborting acquisition on '{}'", self.name());
        self.device.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::mock::{range_option, word_list_option, MockDevice};
    use crate::device::RawConstraint;
    use crate::scanner::WriteOutcome;

    fn open(device: &Arc<MockDevice>) -> Scanner {
        let scanner = Scanner::from_device("mock", device.clone());
        device.clear_writes();
        scanner
    }

    fn small_flatbed() -> Arc<MockDevice> {
        let device = Arc::new(MockDevice::flatbed());
        device.on_write("short-resolution", |_, _| {});
        device.replace_constraint("resolution", RawConstraint::WordList(vec![10, 20, 300]));
        device
    }

    #[test]
    fn test_uniform_resolutions_intersect_axes() {
        let device = Arc::new(MockDevice::flatbed());
        device.push_option(word_list_option("x-resolution", Unit::Dpi, &[50, 100, 200], 100));
        device.push_option(word_list_option("y-resolution", Unit::Dpi, &[100, 200, 300], 100));
        let scanner = open(&device);

        assert_eq!(scanner.uniform_resolutions(), vec![100.0, 200.0]);
    }

    #[test]
    fn test_uniform_resolutions_fall_back_when_disjoint() {
        let device = Arc::new(MockDevice::flatbed());
        device.push_option(word_list_option("x-resolution", Unit::Dpi, &[150, 75], 75));
        device.push_option(word_list_option("y-resolution", Unit::Dpi, &[100, 200], 100));
        let scanner = open(&device);

        assert_eq!(scanner.uniform_resolutions(), vec![75.0]);
    }

    #[test]
    fn test_combined_resolution() {
        let device = Arc::new(MockDevice::flatbed());
        device.push_option(word_list_option("y-resolution", Unit::Dpi, &[150, 300, 600], 600));
        let scanner = open(&device);

        assert_eq!(scanner.resolution(), Some(Resolution { x: 300.0, y: 600.0 }));
        scanner
            .set_resolution(Resolution { x: 600.0, y: 150.0 })
            .unwrap();
        assert_eq!(scanner.option_value("resolution"), Some(OptionValue::Int(150)));
        assert_eq!(scanner.resolution(), Some(Resolution { x: 150.0, y: 150.0 }));
    }

    #[test]
    fn test_pixel_bounds_follow_resolution() {
        let device = Arc::new(MockDevice::flatbed());
        for name in ["tl-x", "tl-y", "br-x", "br-y"] {
            device.replace_option(range_option(name, Unit::Pixel, 0, 2550, 0));
        }
        let scanner = open(&device);

        let max = scanner.maximum_bounds().unwrap();
        assert!((max.right - 215.9).abs() < 1e-9);
        assert_eq!(max.left, 0.0);

        scanner.set_resolution(Resolution::uniform(150.0)).unwrap();
        let max = scanner.maximum_bounds().unwrap();
        assert!((max.right - 431.8).abs() < 1e-9);
        assert!((max.bottom - 431.8).abs() < 1e-9);

        scanner
            .set_bounds(Bounds {
                left: 0.0,
                top: 0.0,
                right: 25.4,
                bottom: 50.8,
            })
            .unwrap();
        assert_eq!(scanner.option_value("br-x"), Some(OptionValue::Int(150)));
        assert_eq!(scanner.option_value("br-y"), Some(OptionValue::Int(300)));
    }

    #[test]
    fn test_start_allocates_image() {
        let device = small_flatbed();
        let scanner = open(&device);
        scanner.set_resolution(Resolution::uniform(10.0)).unwrap();

        let image = scanner.start(false).unwrap();
        assert!(scanner.is_scanning());
        assert_eq!(image.width, 85);
        assert_eq!(image.height, 117);
        assert_eq!(image.format, PixelFormat::Rgb24);
        assert_eq!(image.data.len(), 85 * 3 * 117);
        assert_eq!(image.dots_per_meter_x, 394);
        assert!(matches!(scanner.start(false), Err(ScanError::AlreadyScanning)));
        scanner.cancel().unwrap();
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn test_reads_every_line_then_end_of_data() {
        let device = small_flatbed();
        let scanner = open(&device);
        scanner.set_resolution(Resolution::uniform(10.0)).unwrap();
        let image = scanner.start(false).unwrap();

        let mut count = 0;
        loop {
            match scanner.read_scan_line().unwrap() {
                ScanLine::Line { index, data } => {
                    assert_eq!(index, count);
                    assert_eq!(data.len(), image.bytes_per_line);
                    assert_eq!(data[0], index as u8);
                    count += 1;
                }
                ScanLine::EndOfData => break,
                ScanLine::Cancelled => panic!("unexpected cancel"),
            }
        }
        assert_eq!(count, image.height);
        scanner.cancel().unwrap();
    }

    #[test]
    fn test_read_failure_is_reported() {
        let device = small_flatbed();
        let scanner = open(&device);
        scanner.set_resolution(Resolution::uniform(10.0)).unwrap();
        device.fail_read_at_line(2, DeviceStatus::Jammed);
        scanner.start(false).unwrap();

        assert!(matches!(scanner.read_scan_line(), Ok(ScanLine::Line { .. })));
        assert!(matches!(scanner.read_scan_line(), Ok(ScanLine::Line { .. })));
        let err = scanner.read_scan_line().unwrap_err();
        assert_eq!(err.status(), Some(DeviceStatus::Jammed));
        scanner.cancel().unwrap();
    }

    #[test]
    fn test_abort_turns_into_cancelled_line() {
        let device = small_flatbed();
        let scanner = open(&device);
        scanner.set_resolution(Resolution::uniform(10.0)).unwrap();
        scanner.start(false).unwrap();
        scanner.abort();

        assert_eq!(scanner.read_scan_line().unwrap(), ScanLine::Cancelled);
        assert!(scanner.is_scanning());
        scanner.cancel().unwrap();
    }

    #[test]
    fn test_start_failure_stays_idle() {
        let device = small_flatbed();
        let scanner = open(&device);
        let before = (scanner.resolution(), scanner.bounds());
        device.fail_start(Some(DeviceStatus::CoverOpen));

        let err = scanner.start(true).unwrap_err();
        assert_eq!(err.status(), Some(DeviceStatus::CoverOpen));
        assert!(!scanner.is_scanning());
        assert_eq!((scanner.resolution(), scanner.bounds()), before);
        assert_eq!(scanner.option_value("preview"), Some(OptionValue::Bool(false)));
    }

    #[test]
    fn test_preview_uses_lowest_resolution_and_full_area() {
        let device = small_flatbed();
        let scanner = open(&device);
        let cropped = Bounds {
            left: 10.0,
            top: 20.0,
            right: 100.0,
            bottom: 150.0,
        };
        scanner.set_bounds(cropped).unwrap();

        let image = scanner.start(true).unwrap();
        assert_eq!(scanner.resolution(), Some(Resolution::uniform(10.0)));
        assert_eq!(scanner.option_value("preview"), Some(OptionValue::Bool(true)));
        assert_eq!(image.width, 85);

        scanner.cancel().unwrap();
        assert_eq!(scanner.resolution(), Some(Resolution::uniform(300.0)));
        assert_eq!(scanner.option_value("preview"), Some(OptionValue::Bool(false)));
        let bounds = scanner.bounds().unwrap();
        assert!((bounds.left - 10.0).abs() < 1e-4);
        assert!((bounds.bottom - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_edit_during_preview_survives_restore() {
        let device = small_flatbed();
        let scanner = open(&device);
        scanner.start(true).unwrap();

        assert_eq!(
            scanner.set_option_value("resolution", 20).unwrap(),
            WriteOutcome::Deferred
        );
        scanner.cancel().unwrap();
        assert_eq!(scanner.option_value("resolution"), Some(OptionValue::Int(20)));
        assert_eq!(
            device.wire_value("resolution"),
            Some(crate::device::WireValue::Words(vec![20]))
        );
    }

    #[test]
    fn test_cancel_when_idle_still_aborts_device() {
        let device = small_flatbed();
        let scanner = open(&device);
        assert!(matches!(scanner.cancel(), Err(ScanError::NotScanning)));
        assert_eq!(device.cancel_count(), 1);
        assert!(matches!(scanner.read_scan_line(), Err(ScanError::NotScanning)));
    }

    #[test]
    fn test_image_write_line_grows_unknown_height() {
        let params = ScanParameters {
            format: FrameFormat::Gray,
            last_frame: true,
            bytes_per_line: 4,
            pixels_per_line: 4,
            lines: None,
            depth: 8,
        };
        let mut image = ScanImage::new(&params, Resolution::uniform(300.0));
        assert_eq!(image.height, 0);
        image.write_line(1, &[1, 2, 3, 4, 5]);
        assert_eq!(image.height, 2);
        assert_eq!(image.line(1), Some(&[1, 2, 3, 4][..]));
        assert_eq!(image.line(0), Some(&[0, 0, 0, 0][..]));
        assert_eq!(image.dots_per_meter_x, 11811);
    }
}
