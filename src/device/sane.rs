//! Native SANE backend.
//!
//! Thin FFI layer over the system `libsane`. Only compiled with the
//! `sane_hardware` feature. All pointers handed out by the library are copied
//! into owned Rust types before returning.
#![allow(unsafe_code)]

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    Capabilities, DeviceInfo, DeviceStatus, FrameFormat, OptionDescriptor, RawConstraint,
    ScanParameters, ScannerBackend, ScannerDevice, SetInfo, Unit, ValueType, WireValue, Word,
    WORD_SIZE,
};
use crate::error::{AppResult, ScanError};

type SaneHandle = *mut c_void;
type SaneStatus = c_int;

const ACTION_GET_VALUE: c_int = 0;
const ACTION_SET_VALUE: c_int = 1;

const CONSTRAINT_RANGE: c_int = 1;
const CONSTRAINT_WORD_LIST: c_int = 2;
const CONSTRAINT_STRING_LIST: c_int = 3;

#[repr(C)]
struct SaneDevice {
    name: *const c_char,
    vendor: *const c_char,
    model: *const c_char,
    kind: *const c_char,
}

#[repr(C)]
struct SaneRange {
    min: Word,
    max: Word,
    quant: Word,
}

#[repr(C)]
union SaneConstraint {
    string_list: *const *const c_char,
    word_list: *const Word,
    range: *const SaneRange,
}

#[repr(C)]
struct SaneOptionDescriptor {
    name: *const c_char,
    title: *const c_char,
    desc: *const c_char,
    value_type: c_int,
    unit: c_int,
    size: c_int,
    cap: c_int,
    constraint_type: c_int,
    constraint: SaneConstraint,
}

#[repr(C)]
#[derive(Default)]
struct SaneParameters {
    format: c_int,
    last_frame: c_int,
    bytes_per_line: c_int,
    pixels_per_line: c_int,
    lines: c_int,
    depth: c_int,
}

type AuthCallback = Option<extern "C" fn(*const c_char, *mut c_char, *mut c_char)>;

#[link(name = "sane")]
extern "C" {
    fn sane_init(version_code: *mut c_int, authorize: AuthCallback) -> SaneStatus;
    fn sane_exit();
    fn sane_get_devices(device_list: *mut *mut *const SaneDevice, local_only: c_int) -> SaneStatus;
    fn sane_open(name: *const c_char, handle: *mut SaneHandle) -> SaneStatus;
    fn sane_close(handle: SaneHandle);
    fn sane_get_option_descriptor(handle: SaneHandle, option: c_int)
        -> *const SaneOptionDescriptor;
    fn sane_control_option(
        handle: SaneHandle,
        option: c_int,
        action: c_int,
        value: *mut c_void,
        info: *mut c_int,
    ) -> SaneStatus;
    fn sane_get_parameters(handle: SaneHandle, params: *mut SaneParameters) -> SaneStatus;
    fn sane_start(handle: SaneHandle) -> SaneStatus;
    fn sane_read(handle: SaneHandle, data: *mut u8, max_length: c_int, length: *mut c_int)
        -> SaneStatus;
    fn sane_cancel(handle: SaneHandle);
}

fn check(status: SaneStatus) -> Result<(), DeviceStatus> {
    match DeviceStatus::from_code(status) {
        DeviceStatus::Good => Ok(()),
        other => Err(other),
    }
}

/// Copy a possibly-null C string.
unsafe fn owned_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

unsafe fn read_constraint(desc: &SaneOptionDescriptor) -> RawConstraint {
    match desc.constraint_type {
        CONSTRAINT_RANGE if !desc.constraint.range.is_null() => {
            let range = &*desc.constraint.range;
            RawConstraint::Range {
                min: range.min,
                max: range.max,
                quant: range.quant,
            }
        }
        CONSTRAINT_WORD_LIST if !desc.constraint.word_list.is_null() => {
            // First word is the number of entries that follow.
            let list = desc.constraint.word_list;
            let count = usize::try_from(*list).unwrap_or(0);
            RawConstraint::WordList(std::slice::from_raw_parts(list.add(1), count).to_vec())
        }
        CONSTRAINT_STRING_LIST if !desc.constraint.string_list.is_null() => {
            let mut strings = Vec::new();
            let mut cursor = desc.constraint.string_list;
            while !(*cursor).is_null() {
                strings.push(owned_string(*cursor));
                cursor = cursor.add(1);
            }
            RawConstraint::StringList(strings)
        }
        _ => RawConstraint::None,
    }
}

/// `libsane` as a [`ScannerBackend`].
pub struct SaneBackend {
    initialized: Mutex<bool>,
}

impl SaneBackend {
    /// Backend handle; the library is initialized lazily by `init`.
    pub fn new() -> Self {
        Self {
            initialized: Mutex::new(false),
        }
    }
}

impl Default for SaneBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerBackend for SaneBackend {
    fn init(&self) -> AppResult<()> {
        let mut initialized = self.initialized.lock();
        if *initialized {
            return Ok(());
        }
        let mut version: c_int = 0;
        check(unsafe { sane_init(&mut version, None) })
            .map_err(|status| ScanError::device("initializing SANE", status))?;
        *initialized = true;
        info!(
            "SANE initialized, version {}.{}.{}",
            (version >> 24) & 0xff,
            (version >> 16) & 0xff,
            version & 0xffff
        );
        Ok(())
    }

    fn exit(&self) {
        let mut initialized = self.initialized.lock();
        if *initialized {
            unsafe { sane_exit() };
            *initialized = false;
            debug!("SANE shut down");
        }
    }

    fn devices(&self, local_only: bool) -> AppResult<Vec<DeviceInfo>> {
        let mut list: *mut *const SaneDevice = ptr::null_mut();
        check(unsafe { sane_get_devices(&mut list, c_int::from(local_only)) })
            .map_err(|status| ScanError::device("getting devices", status))?;

        let mut devices = Vec::new();
        if list.is_null() {
            return Ok(devices);
        }
        unsafe {
            let mut cursor = list;
            while !(*cursor).is_null() {
                let device = &**cursor;
                devices.push(DeviceInfo {
                    name: owned_string(device.name),
                    vendor: owned_string(device.vendor),
                    model: owned_string(device.model),
                    device_type: owned_string(device.kind),
                });
                cursor = cursor.add(1);
            }
        }
        Ok(devices)
    }

    fn open(&self, name: &str) -> AppResult<Arc<dyn ScannerDevice>> {
        let c_name = CString::new(name)
            .map_err(|_| ScanError::device(format!("opening device {name}"), DeviceStatus::Invalid))?;
        let mut handle: SaneHandle = ptr::null_mut();
        check(unsafe { sane_open(c_name.as_ptr(), &mut handle) })
            .map_err(|status| ScanError::device("opening device", status))?;
        info!("Opened SANE device '{}'", name);
        Ok(Arc::new(SaneScanner { handle }))
    }
}

impl Drop for SaneBackend {
    fn drop(&mut self) {
        self.exit();
    }
}

/// One open SANE handle.
struct SaneScanner {
    handle: SaneHandle,
}

// The handle is only used behind the scanner's Idle/Scanning gating, and
// sane_cancel is async-safe by the SANE standard.
unsafe impl Send for SaneScanner {}
unsafe impl Sync for SaneScanner {}

fn to_c_int(index: usize) -> Result<c_int, DeviceStatus> {
    c_int::try_from(index).map_err(|_| DeviceStatus::Invalid)
}

/// Lay `words` over `base` in a buffer of at least `count` words. Words the
/// caller did not give keep their `base` value, or zero.
fn fit_words(words: &[Word], mut base: Vec<Word>, count: usize) -> Vec<Word> {
    base.resize(count.max(words.len()).max(1), 0);
    base[..words.len()].copy_from_slice(words);
    base
}

impl ScannerDevice for SaneScanner {
    fn option_descriptor(&self, index: usize) -> Option<OptionDescriptor> {
        let index = to_c_int(index).ok()?;
        unsafe {
            let desc = sane_get_option_descriptor(self.handle, index);
            if desc.is_null() {
                return None;
            }
            let desc = &*desc;
            Some(OptionDescriptor {
                name: owned_string(desc.name),
                title: owned_string(desc.title),
                description: owned_string(desc.desc),
                value_type: ValueType::from_code(desc.value_type),
                unit: Unit::from_code(desc.unit),
                size: usize::try_from(desc.size).unwrap_or(0),
                capabilities: Capabilities::from_bits_truncate(desc.cap as u32),
                constraint: read_constraint(desc),
            })
        }
    }

    fn get_value(&self, index: usize) -> Result<WireValue, DeviceStatus> {
        let desc = self.option_descriptor(index).ok_or(DeviceStatus::Invalid)?;
        let option = to_c_int(index)?;
        match desc.value_type {
            ValueType::Button | ValueType::Group => Ok(WireValue::None),
            ValueType::String => {
                let mut buffer = vec![0u8; desc.size.max(1)];
                check(unsafe {
                    sane_control_option(
                        self.handle,
                        option,
                        ACTION_GET_VALUE,
                        buffer.as_mut_ptr().cast(),
                        ptr::null_mut(),
                    )
                })?;
                let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
                Ok(WireValue::Text(String::from_utf8_lossy(&buffer[..end]).into_owned()))
            }
            _ => {
                let mut words: Vec<Word> = vec![0; (desc.size / WORD_SIZE).max(1)];
                check(unsafe {
                    sane_control_option(
                        self.handle,
                        option,
                        ACTION_GET_VALUE,
                        words.as_mut_ptr().cast(),
                        ptr::null_mut(),
                    )
                })?;
                Ok(WireValue::Words(words))
            }
        }
    }

    fn set_value(&self, index: usize, value: &WireValue) -> Result<SetInfo, DeviceStatus> {
        let option = to_c_int(index)?;
        let mut info: c_int = 0;
        let status = match value {
            WireValue::Words(words) => {
                // libsane reads the full descriptor size, whatever we pass.
                let count = self.option_descriptor(index).map_or(0, |d| d.size / WORD_SIZE);
                let current = match self.get_value(index) {
                    Ok(WireValue::Words(current)) => current,
                    _ => Vec::new(),
                };
                let mut words = fit_words(words, current, count);
                unsafe {
                    sane_control_option(
                        self.handle,
                        option,
                        ACTION_SET_VALUE,
                        words.as_mut_ptr().cast(),
                        &mut info,
                    )
                }
            }
            WireValue::Text(text) => {
                let size = self.option_descriptor(index).map_or(0, |d| d.size);
                let mut buffer = text.as_bytes().to_vec();
                buffer.resize(size.max(buffer.len() + 1), 0);
                unsafe {
                    sane_control_option(
                        self.handle,
                        option,
                        ACTION_SET_VALUE,
                        buffer.as_mut_ptr().cast(),
                        &mut info,
                    )
                }
            }
            WireValue::None => unsafe {
                sane_control_option(
                    self.handle,
                    option,
                    ACTION_SET_VALUE,
                    ptr::null_mut(),
                    &mut info,
                )
            },
        };
        check(status)?;
        Ok(SetInfo::from_bits_truncate(info as u32))
    }

    fn start(&self) -> Result<(), DeviceStatus> {
        check(unsafe { sane_start(self.handle) })
    }

    fn parameters(&self) -> Result<ScanParameters, DeviceStatus> {
        let mut params = SaneParameters::default();
        check(unsafe { sane_get_parameters(self.handle, &mut params) })?;
        Ok(ScanParameters {
            format: FrameFormat::from_code(params.format),
            last_frame: params.last_frame != 0,
            bytes_per_line: usize::try_from(params.bytes_per_line).unwrap_or(0),
            pixels_per_line: usize::try_from(params.pixels_per_line).unwrap_or(0),
            // Negative means the device cannot tell (hand scanners).
            lines: usize::try_from(params.lines).ok(),
            depth: u32::try_from(params.depth).unwrap_or(8),
        })
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, DeviceStatus> {
        let max_length = c_int::try_from(buffer.len()).unwrap_or(c_int::MAX);
        let mut length: c_int = 0;
        check(unsafe { sane_read(self.handle, buffer.as_mut_ptr(), max_length, &mut length) })?;
        Ok(usize::try_from(length).unwrap_or(0))
    }

    fn cancel(&self) {
        unsafe { sane_cancel(self.handle) };
    }
}

impl Drop for SaneScanner {
    fn drop(&mut self) {
        if self.handle.is_null() {
            warn!("Dropping SANE device without a handle");
            return;
        }
        unsafe { sane_close(self.handle) };
        debug!("SANE device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_word_list_is_padded_to_descriptor_size() {
        let words = fit_words(&[1, 2], Vec::new(), 256);
        assert_eq!(words.len(), 256);
        assert_eq!(&words[..3], &[1, 2, 0]);
    }

    #[test]
    fn test_untouched_words_keep_current_values() {
        let words = fit_words(&[7], vec![1, 2, 3, 4], 4);
        assert_eq!(words, vec![7, 2, 3, 4]);
    }

    #[test]
    fn test_scalar_and_long_writes_keep_their_length() {
        assert_eq!(fit_words(&[5], Vec::new(), 0), vec![5]);
        assert_eq!(fit_words(&[1, 2, 3], vec![0], 1), vec![1, 2, 3]);
        assert_eq!(fit_words(&[], Vec::new(), 0), vec![0]);
    }
}
