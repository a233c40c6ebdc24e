//! Semantic option values and constraints.
//!
//! The device speaks in words and scaled fixed-point integers; everything in
//! this module is the semantic side of that boundary. [`OptionValue::from_wire`]
//! and [`OptionValue::to_wire`] are the only places where the two meet.

use serde::{Deserialize, Serialize};

use crate::device::{
    fix, unfix, OptionDescriptor, RawConstraint, ValueType, WireValue, Word, WORD_SIZE,
};

/// Semantic type of an option: protocol type times scalar/list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    /// Single boolean.
    Bool,
    /// Single integer.
    Int,
    /// Single fixed-point value, exposed as `f64`.
    Fixed,
    /// String.
    String,
    /// Action without a value.
    Button,
    /// Group header.
    Group,
    /// Vector of booleans.
    BoolList,
    /// Vector of integers.
    IntList,
    /// Vector of fixed-point values.
    FixedList,
}

impl OptionType {
    /// Derive the semantic type from a descriptor's type and size.
    pub fn from_descriptor(desc: &OptionDescriptor) -> Self {
        let scalar = desc.size <= WORD_SIZE;
        match (desc.value_type, scalar) {
            (ValueType::Bool, true) => Self::Bool,
            (ValueType::Bool, false) => Self::BoolList,
            (ValueType::Int, true) => Self::Int,
            (ValueType::Int, false) => Self::IntList,
            (ValueType::Fixed, true) => Self::Fixed,
            (ValueType::Fixed, false) => Self::FixedList,
            (ValueType::String, _) => Self::String,
            (ValueType::Button, _) => Self::Button,
            (ValueType::Group, _) => Self::Group,
        }
    }

    /// Whether options of this type carry a value.
    pub fn has_value(&self) -> bool {
        !matches!(self, Self::Button | Self::Group)
    }

    /// Whether this is a vector type.
    pub fn is_list(&self) -> bool {
        matches!(self, Self::BoolList | Self::IntList | Self::FixedList)
    }
}

/// Semantic value of an option.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum OptionValue {
    /// No value (buttons, groups, inactive options never read).
    #[default]
    None,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(Word),
    /// Floating-point (fixed-point on the wire).
    Fixed(f64),
    /// String.
    String(String),
    /// Vector of booleans.
    BoolList(Vec<bool>),
    /// Vector of integers.
    IntList(Vec<Word>),
    /// Vector of floating-point values.
    FixedList(Vec<f64>),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Word> for OptionValue {
    fn from(value: Word) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        Self::Fixed(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join<T: std::fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            Self::None => Ok(()),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Fixed(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::BoolList(v) => write!(f, "[{}]", join(v)),
            Self::IntList(v) => write!(f, "[{}]", join(v)),
            Self::FixedList(v) => write!(f, "[{}]", join(v)),
        }
    }
}

impl OptionValue {
    /// Zero value of the given type.
    pub fn zero(option_type: OptionType) -> Self {
        match option_type {
            OptionType::Bool => Self::Bool(false),
            OptionType::Int => Self::Int(0),
            OptionType::Fixed => Self::Fixed(0.0),
            OptionType::String => Self::String(String::new()),
            OptionType::BoolList => Self::BoolList(Vec::new()),
            OptionType::IntList => Self::IntList(Vec::new()),
            OptionType::FixedList => Self::FixedList(Vec::new()),
            OptionType::Button | OptionType::Group => Self::None,
        }
    }

    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Int(v) => Some(f64::from(*v)),
            Self::Fixed(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of a scalar value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Convert to `option_type` when the conversion is meaningful.
    ///
    /// Numeric scalars convert freely between bool, int and fixed; numeric
    /// lists between int and fixed lists. Strings only stay strings.
    pub fn coerce(self, option_type: OptionType) -> Option<Self> {
        match (option_type, self) {
            (OptionType::Button | OptionType::Group, _) => Some(Self::None),
            (OptionType::Bool, Self::Bool(v)) => Some(Self::Bool(v)),
            (OptionType::Bool, Self::Int(v)) => Some(Self::Bool(v != 0)),
            (OptionType::Bool, Self::Fixed(v)) => Some(Self::Bool(v != 0.0)),
            (OptionType::Int, Self::Int(v)) => Some(Self::Int(v)),
            (OptionType::Int, Self::Bool(v)) => Some(Self::Int(Word::from(v))),
            (OptionType::Int, Self::Fixed(v)) => Some(Self::Int(v.round() as Word)),
            (OptionType::Fixed, Self::Fixed(v)) => Some(Self::Fixed(v)),
            (OptionType::Fixed, Self::Int(v)) => Some(Self::Fixed(f64::from(v))),
            (OptionType::Fixed, Self::Bool(v)) => Some(Self::Fixed(if v { 1.0 } else { 0.0 })),
            (OptionType::String, Self::String(v)) => Some(Self::String(v)),
            (OptionType::BoolList, Self::BoolList(v)) => Some(Self::BoolList(v)),
            (OptionType::IntList, Self::IntList(v)) => Some(Self::IntList(v)),
            (OptionType::IntList, Self::FixedList(v)) => Some(Self::IntList(
                v.into_iter().map(|x| x.round() as Word).collect(),
            )),
            (OptionType::FixedList, Self::FixedList(v)) => Some(Self::FixedList(v)),
            (OptionType::FixedList, Self::IntList(v)) => Some(Self::FixedList(
                v.into_iter().map(f64::from).collect(),
            )),
            _ => None,
        }
    }

    /// Decode a wire value for an option of `option_type`.
    ///
    /// Malformed wire data decodes to the type's zero value.
    pub fn from_wire(wire: &WireValue, option_type: OptionType) -> Self {
        match (option_type, wire) {
            (OptionType::Bool, WireValue::Words(w)) if !w.is_empty() => Self::Bool(w[0] != 0),
            (OptionType::Int, WireValue::Words(w)) if !w.is_empty() => Self::Int(w[0]),
            (OptionType::Fixed, WireValue::Words(w)) if !w.is_empty() => Self::Fixed(unfix(w[0])),
            (OptionType::BoolList, WireValue::Words(w)) => {
                Self::BoolList(w.iter().map(|x| *x != 0).collect())
            }
            (OptionType::IntList, WireValue::Words(w)) => Self::IntList(w.clone()),
            (OptionType::FixedList, WireValue::Words(w)) => {
                Self::FixedList(w.iter().copied().map(unfix).collect())
            }
            (OptionType::String, WireValue::Text(s)) => Self::String(s.clone()),
            _ => Self::zero(option_type),
        }
    }

    /// Encode for the wire. The value must already be of the option's type
    /// (see [`OptionValue::coerce`]).
    pub fn to_wire(&self) -> WireValue {
        match self {
            Self::None => WireValue::None,
            Self::Bool(v) => WireValue::Words(vec![Word::from(*v)]),
            Self::Int(v) => WireValue::Words(vec![*v]),
            Self::Fixed(v) => WireValue::Words(vec![fix(*v)]),
            Self::String(v) => WireValue::Text(v.clone()),
            Self::BoolList(v) => WireValue::Words(v.iter().map(|x| Word::from(*x)).collect()),
            Self::IntList(v) => WireValue::Words(v.clone()),
            Self::FixedList(v) => WireValue::Words(v.iter().copied().map(fix).collect()),
        }
    }
}

// =============================================================================
// Constraints
// =============================================================================

/// Numeric range in semantic units. A quantization of 0 means continuous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Minimum (inclusive).
    pub min: f64,
    /// Maximum (inclusive).
    pub max: f64,
    /// Step between legal values, 0 for continuous.
    pub quantization: f64,
}

impl Range {
    /// Whether any value between `min` and `max` is legal.
    pub fn is_continuous(&self) -> bool {
        self.quantization == 0.0
    }

    /// Whether `value` lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Allowed-value shape of an option in semantic units.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Constraint {
    /// Any value.
    #[default]
    None,
    /// Numeric range.
    Range(Range),
    /// Ordered list of allowed values (numbers or strings).
    Values(Vec<OptionValue>),
}

impl Constraint {
    /// Translate a raw constraint for an option of `value_type`.
    pub fn from_raw(raw: &RawConstraint, value_type: ValueType) -> Self {
        let to_value = |word: Word| match value_type {
            ValueType::Fixed => OptionValue::Fixed(unfix(word)),
            _ => OptionValue::Int(word),
        };
        let to_number = |word: Word| match value_type {
            ValueType::Fixed => unfix(word),
            _ => f64::from(word),
        };
        match raw {
            RawConstraint::None => Self::None,
            RawConstraint::Range { min, max, quant } => Self::Range(Range {
                min: to_number(*min),
                max: to_number(*max),
                quantization: to_number(*quant),
            }),
            RawConstraint::WordList(words) => {
                Self::Values(words.iter().copied().map(to_value).collect())
            }
            RawConstraint::StringList(strings) => {
                Self::Values(strings.iter().cloned().map(OptionValue::String).collect())
            }
        }
    }

    /// Allowed values of a list constraint, empty otherwise.
    pub fn allowed_values(&self) -> &[OptionValue] {
        match self {
            Self::Values(values) => values,
            _ => &[],
        }
    }

    /// Range of a range constraint.
    pub fn range(&self) -> Option<Range> {
        match self {
            Self::Range(range) => Some(*range),
            _ => None,
        }
    }

    /// Whether this is a discrete list.
    pub fn is_list(&self) -> bool {
        matches!(self, Self::Values(_))
    }

    /// Whether `value` satisfies the constraint.
    pub fn contains(&self, value: &OptionValue) -> bool {
        match self {
            Self::None => true,
            Self::Range(range) => value.as_f64().is_some_and(|v| range.contains(v)),
            Self::Values(values) => values.contains(value),
        }
    }

    /// The Nth allowed value. Out-of-range indices fall back to the first
    /// allowed value, and an empty list to the zero value of `option_type`.
    pub fn nth_value(&self, index: usize, option_type: OptionType) -> OptionValue {
        let values = self.allowed_values();
        values
            .get(index)
            .or_else(|| values.first())
            .cloned()
            .unwrap_or_else(|| OptionValue::zero(option_type))
    }

    /// Index of `value` in the allowed list, 0 when absent.
    pub fn index_of(&self, value: &OptionValue) -> usize {
        self.allowed_values()
            .iter()
            .position(|v| v == value)
            .unwrap_or(0)
    }

    /// Numeric values of a list constraint; the end points of a range.
    pub fn numeric_values(&self) -> Vec<f64> {
        match self {
            Self::None => Vec::new(),
            Self::Range(range) => vec![range.min, range.max],
            Self::Values(values) => values.iter().filter_map(OptionValue::as_f64).collect(),
        }
    }

    /// Smallest and largest numeric value allowed.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        match self {
            Self::Range(range) => Some((range.min, range.max)),
            _ => {
                let values = self.numeric_values();
                let min = values.iter().copied().reduce(f64::min)?;
                let max = values.iter().copied().reduce(f64::max)?;
                Some((min, max))
            }
        }
    }
}
