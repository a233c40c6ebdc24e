//! Option Registry
//!
//! Ordered collection of the options of one opened device with O(1) lookup
//! by name. The registry is built once on open and reloaded in place when a
//! write reports that other options may have changed; option identities
//! (model index, name, position) survive a reload, only their content
//! changes.
//!
//! Device failures while reading values are logged and degrade to the
//! previous value (or the type's zero value on first read). They never stop a
//! build or reload. Options holding a deferred, unapplied value keep that
//! value across a reload until it is written.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::device::ScannerDevice;
use crate::option::{DeviceOption, OptionValue};

/// All options of an opened device.
#[derive(Debug, Default, Clone)]
pub struct OptionRegistry {
    options: Vec<DeviceOption>,
    by_name: HashMap<String, usize>,
}

impl OptionRegistry {
    /// Read every descriptor from the device, stopping at the first missing
    /// one, and fetch the value of every active option.
    pub fn build(device: &dyn ScannerDevice) -> Self {
        let mut registry = Self::default();

        for protocol_index in 1.. {
            let Some(desc) = device.option_descriptor(protocol_index) else {
                break;
            };
            let index = registry.options.len();
            let mut option = DeviceOption::new(index, &desc);
            option.store_value(read_value(device, &option));
            if !option.name().is_empty() {
                registry.by_name.insert(option.name().to_string(), index);
            }
            registry.options.push(option);
        }

        debug!("Option registry built with {} options", registry.options.len());
        registry
    }

    /// Re-read every descriptor and every active value, in place.
    pub fn reload(&mut self, device: &dyn ScannerDevice) {
        for index in 0..self.options.len() {
            self.refresh_option(device, index);
        }
        debug!("Reloaded {} options", self.options.len());
    }

    /// Re-read one option's descriptor and value. An option holding an
    /// unapplied value keeps it; only its metadata is refreshed.
    pub fn refresh_option(&mut self, device: &dyn ScannerDevice, index: usize) {
        let Some(option) = self.options.get_mut(index) else {
            return;
        };
        match device.option_descriptor(option.protocol_index()) {
            Some(desc) => option.update(&desc),
            None => warn!(
                "Descriptor for option '{}' disappeared, keeping previous metadata",
                option.name()
            ),
        }
        if option.has_unapplied_value() {
            debug!("Keeping unapplied value of '{}' across reload", option.name());
            return;
        }
        let value = read_value(device, option);
        option.store_value(value);
    }

    /// Number of options.
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Whether the device exposes no options.
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Model index of the option called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Whether an option called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Option called `name`.
    pub fn find(&self, name: &str) -> Option<&DeviceOption> {
        self.position(name).and_then(|index| self.options.get(index))
    }

    /// Option at model `index`.
    pub fn get(&self, index: usize) -> Option<&DeviceOption> {
        self.options.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut DeviceOption> {
        self.options.get_mut(index)
    }

    /// Options in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceOption> {
        self.options.iter()
    }

    /// Visit every option in registry order.
    pub fn for_each_option(&self, mut visit: impl FnMut(&DeviceOption)) {
        self.options.iter().for_each(|option| visit(option));
    }
}

/// Current value of `option` as reported by the device.
///
/// Inactive and value-less options keep what they had; failed reads keep the
/// previous value, or the zero value if there is none yet.
fn read_value(device: &dyn ScannerDevice, option: &DeviceOption) -> OptionValue {
    let option_type = option.option_type();
    if !option_type.has_value() {
        return OptionValue::None;
    }
    if !option.is_active() {
        return option.value().clone();
    }

    match device.get_value(option.protocol_index()) {
        Ok(wire) => OptionValue::from_wire(&wire, option_type),
        Err(status) => {
            warn!("getting option '{}' failed: {}", option.name(), status);
            match option.value() {
                OptionValue::None => OptionValue::zero(option_type),
                previous => previous.clone(),
            }
        }
    }
}
