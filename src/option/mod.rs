//! Option Value Model
//!
//! [`DeviceOption`] is the typed, observable wrapper around one device
//! option. It keeps a semantic snapshot of the descriptor (type, unit,
//! constraint, capability predicates) plus the last-known value, which mirrors
//! the device unless a write has been deferred while a scan is running.
//!
//! Options are owned by the [`crate::registry::OptionRegistry`]. Callers get
//! clones for display and change values through
//! [`crate::scanner::Scanner::set_option_value`], which applies the
//! apply/reload protocol and raises the change notifications.

pub mod value;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::device::{Capabilities, OptionDescriptor, Unit};

pub use value::{Constraint, OptionType, OptionValue, Range};

/// One device option.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOption {
    index: usize,
    name: String,
    title: String,
    description: String,
    option_type: OptionType,
    unit: Unit,
    capabilities: Capabilities,
    constraint: Constraint,
    value: OptionValue,
    unapplied: bool,
}

impl DeviceOption {
    /// Create the option at model `index` from its descriptor. The value stays
    /// empty until the registry reads it from the device.
    pub(crate) fn new(index: usize, desc: &OptionDescriptor) -> Self {
        let mut option = Self {
            index,
            name: desc.name.clone(),
            title: desc.title.clone(),
            description: desc.description.clone(),
            option_type: OptionType::from_descriptor(desc),
            unit: desc.unit,
            capabilities: desc.capabilities,
            constraint: Constraint::None,
            value: OptionValue::None,
            unapplied: false,
        };
        option.update(desc);
        option
    }

    /// Replace the descriptor-derived snapshot. Name and index never change.
    pub(crate) fn update(&mut self, desc: &OptionDescriptor) {
        self.title = desc.title.clone();
        self.description = desc.description.clone();
        self.option_type = OptionType::from_descriptor(desc);
        self.unit = desc.unit;
        self.capabilities = desc.capabilities;
        self.constraint = Constraint::from_raw(&desc.constraint, desc.value_type);
    }

    /// 0-based position in the registry.
    pub fn index(&self) -> usize {
        self.index
    }

    /// 1-based index used for device I/O.
    pub fn protocol_index(&self) -> usize {
        self.index + 1
    }

    /// Name used for lookup.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Display description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Semantic type.
    pub fn option_type(&self) -> OptionType {
        self.option_type
    }

    /// Unit of the value.
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Allowed-value shape.
    pub fn constraint(&self) -> &Constraint {
        &self.constraint
    }

    /// Last-known value.
    pub fn value(&self) -> &OptionValue {
        &self.value
    }

    /// Whether the option currently has an effect.
    pub fn is_active(&self) -> bool {
        !self.capabilities.contains(Capabilities::INACTIVE)
    }

    /// Whether software may write the option.
    pub fn is_settable(&self) -> bool {
        self.capabilities.contains(Capabilities::SOFT_SELECT)
    }

    /// Whether the option is meant for advanced users.
    pub fn is_advanced(&self) -> bool {
        self.capabilities.contains(Capabilities::ADVANCED)
    }

    /// Whether the device can pick the value automatically.
    pub fn is_automatic(&self) -> bool {
        self.capabilities.contains(Capabilities::AUTOMATIC)
    }

    /// Whether a write is waiting for the current scan to finish.
    pub fn has_unapplied_value(&self) -> bool {
        self.unapplied
    }

    /// Index of the current value among the allowed values (0 when absent).
    pub fn value_index(&self) -> usize {
        self.constraint.index_of(&self.value)
    }

    pub(crate) fn store_value(&mut self, value: OptionValue) -> OptionValue {
        std::mem::replace(&mut self.value, value)
    }

    pub(crate) fn set_unapplied(&mut self, unapplied: bool) {
        self.unapplied = unapplied;
    }
}

impl Serialize for DeviceOption {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("DeviceOption", 11)?;
        s.serialize_field("index", &self.index)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("title", &self.title)?;
        s.serialize_field("description", &self.description)?;
        s.serialize_field("type", &self.option_type)?;
        s.serialize_field("unit", &self.unit)?;
        s.serialize_field("active", &self.is_active())?;
        s.serialize_field("settable", &self.is_settable())?;
        s.serialize_field("advanced", &self.is_advanced())?;
        s.serialize_field("constraint", &self.constraint)?;
        s.serialize_field("value", &self.value)?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RawConstraint, ValueType};

    fn resolution_descriptor(capabilities: Capabilities) -> OptionDescriptor {
        OptionDescriptor {
            name: "resolution".into(),
            title: "Scan resolution".into(),
            description: "Sets the resolution of the scanned image.".into(),
            value_type: ValueType::Int,
            unit: Unit::Dpi,
            size: 4,
            capabilities,
            constraint: RawConstraint::WordList(vec![75, 150, 300]),
        }
    }

    #[test]
    fn test_capability_predicates() {
        let option = DeviceOption::new(
            3,
            &resolution_descriptor(Capabilities::SOFT_SELECT | Capabilities::ADVANCED),
        );
        assert!(option.is_active());
        assert!(option.is_settable());
        assert!(option.is_advanced());
        assert!(!option.is_automatic());
        assert_eq!(option.protocol_index(), 4);

        let inactive = DeviceOption::new(0, &resolution_descriptor(Capabilities::INACTIVE));
        assert!(!inactive.is_active());
        assert!(!inactive.is_settable());
    }

    #[test]
    fn test_update_replaces_constraint_wholesale() {
        let mut option = DeviceOption::new(0, &resolution_descriptor(Capabilities::SOFT_SELECT));
        let mut desc = resolution_descriptor(Capabilities::SOFT_SELECT);
        desc.constraint = RawConstraint::WordList(vec![100, 200]);
        option.update(&desc);

        assert_eq!(
            option.constraint().allowed_values(),
            &[OptionValue::Int(100), OptionValue::Int(200)]
        );
        assert_eq!(option.name(), "resolution");
    }

    #[test]
    fn test_value_index() {
        let mut option = DeviceOption::new(0, &resolution_descriptor(Capabilities::SOFT_SELECT));
        option.store_value(OptionValue::Int(300));
        assert_eq!(option.value_index(), 2);
        option.store_value(OptionValue::Int(1200));
        assert_eq!(option.value_index(), 0);
    }

    #[test]
    fn test_json_snapshot() {
        let mut option = DeviceOption::new(0, &resolution_descriptor(Capabilities::SOFT_SELECT));
        option.store_value(OptionValue::Int(150));
        let json = serde_json::to_value(&option).unwrap();
        assert_eq!(json["name"], "resolution");
        assert_eq!(json["active"], true);
        assert_eq!(json["value"], serde_json::json!({ "Int": 150 }));
    }
}
