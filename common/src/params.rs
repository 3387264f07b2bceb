//! Parameter model: fixed-capacity text buffers plus the metadata needed to
//! render and validate the configuration form.
//!
//! The text buffer is the persisted representation of every field. Typed
//! values only exist after translation (see [`crate::translate`]).

use std::collections::HashSet;

use crate::error::{ConfigError, SubmissionError};

/// Buffer capacity of numeric fields, terminator included.
pub const NUMBER_LEN: usize = 5;
/// Buffer capacity of text and select fields, terminator included.
pub const STRING_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    pub value: &'static str,
    pub label: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Number { min: i64, max: i64 },
    Select { choices: &'static [Choice] },
    Text,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    label: &'static str,
    key: &'static str,
    encoding: Encoding,
    default: &'static str,
    capacity: usize,
    visible: bool,
    value: String,
}

impl Parameter {
    fn new(
        label: &'static str,
        key: &'static str,
        encoding: Encoding,
        default: &'static str,
        capacity: usize,
    ) -> Self {
        let mut param = Self {
            label,
            key,
            encoding,
            default,
            capacity: capacity.max(1),
            visible: true,
            value: String::new(),
        };
        param.reset();
        param
    }

    pub fn number(
        label: &'static str,
        key: &'static str,
        default: &'static str,
        min: i64,
        max: i64,
    ) -> Self {
        Self::new(label, key, Encoding::Number { min, max }, default, NUMBER_LEN)
    }

    pub fn select(
        label: &'static str,
        key: &'static str,
        choices: &'static [Choice],
        default: &'static str,
    ) -> Self {
        Self::new(label, key, Encoding::Select { choices }, default, STRING_LEN)
    }

    pub fn text(label: &'static str, key: &'static str, default: &'static str, capacity: usize) -> Self {
        Self::new(label, key, Encoding::Text, default, capacity)
    }

    pub fn password(label: &'static str, key: &'static str, default: &'static str, capacity: usize) -> Self {
        Self::new(label, key, Encoding::Password, default, capacity)
    }

    /// Keeps the parameter in the store but out of the rendered form.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn default_value(&self) -> &'static str {
        self.default
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Stores `value`, truncated to `capacity - 1` bytes on a char boundary.
    pub fn set_value(&mut self, value: &str) {
        let max = self.capacity - 1;
        let mut end = value.len().min(max);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.value.clear();
        self.value.push_str(&value[..end]);
    }

    pub fn reset(&mut self) {
        let default = self.default;
        self.set_value(default);
    }

    /// Label of the current select value, if this is a select field holding
    /// one of its choices.
    pub fn selected_label(&self) -> Option<&'static str> {
        match self.encoding {
            Encoding::Select { choices } => choices
                .iter()
                .find(|choice| choice.value == self.value)
                .map(|choice| choice.label),
            _ => None,
        }
    }

    /// Form-side validation of a submitted value.
    pub fn validate(&self, candidate: &str) -> Result<(), SubmissionError> {
        let label = self.label.to_string();
        match self.encoding {
            Encoding::Number { min, max } => {
                let trimmed = candidate.trim();
                if trimmed.is_empty() {
                    return Err(SubmissionError::Empty { label });
                }
                let value = trimmed
                    .parse::<i64>()
                    .map_err(|_| SubmissionError::NotANumber {
                        label: label.clone(),
                        value: trimmed.to_string(),
                    })?;
                if !(min..=max).contains(&value) {
                    return Err(SubmissionError::OutOfRange {
                        label,
                        value,
                        min,
                        max,
                    });
                }
                Ok(())
            }
            Encoding::Select { choices } => {
                if choices.iter().any(|choice| choice.value == candidate) {
                    Ok(())
                } else {
                    Err(SubmissionError::UnknownChoice {
                        label,
                        value: candidate.to_string(),
                    })
                }
            }
            Encoding::Text | Encoding::Password => {
                if candidate.len() > self.capacity - 1 {
                    Err(SubmissionError::TooLong {
                        label,
                        max: self.capacity - 1,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterGroup {
    id: &'static str,
    label: &'static str,
    items: Vec<Parameter>,
}

impl ParameterGroup {
    pub fn new(id: &'static str, label: &'static str) -> Self {
        Self {
            id,
            label,
            items: Vec::new(),
        }
    }

    pub fn with(mut self, param: Parameter) -> Self {
        self.items.push(param);
        self
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn items(&self) -> &[Parameter] {
        &self.items
    }
}

/// Every parameter the node knows about, in form order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSet {
    groups: Vec<ParameterGroup>,
}

impl ParameterSet {
    pub fn new(groups: Vec<ParameterGroup>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for param in groups.iter().flat_map(|group| group.items.iter()) {
            if !seen.insert(param.key) {
                return Err(ConfigError::DuplicateKey(param.key.to_string()));
            }
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.groups.iter().flat_map(|group| group.items.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.groups.iter_mut().flat_map(|group| group.items.iter_mut())
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.iter().find(|param| param.key == key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Parameter> {
        self.iter_mut().find(|param| param.key == key)
    }

    /// Current buffer of `key`; empty when the key is unknown.
    pub fn value(&self, key: &str) -> &str {
        self.get(key).map(Parameter::value).unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let param = self
            .get_mut(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        param.set_value(value);
        Ok(())
    }

    pub fn reset_all(&mut self) {
        for param in self.iter_mut() {
            param.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const COLORS: &[Choice] = &[
        Choice {
            value: "1",
            label: "red",
        },
        Choice {
            value: "2",
            label: "blue",
        },
    ];

    #[test]
    fn set_value_truncates_to_capacity() {
        let mut param = Parameter::number("Instance", "instance", "255", 1, 255);
        param.set_value("123456789");
        assert_eq!(param.value(), "1234");

        let mut text = Parameter::text("Name", "name", "", 4);
        text.set_value("aé€x");
        // "a" + "é" = 3 bytes, "€" would overflow the 3 byte limit.
        assert_eq!(text.value(), "aé");
    }

    #[test]
    fn select_stores_value_not_label() {
        let mut param = Parameter::select("Color", "color", COLORS, "1");
        param.set_value("2");
        assert_eq!(param.value(), "2");
        assert_eq!(param.selected_label(), Some("blue"));

        param.set_value("blue");
        assert_eq!(param.selected_label(), None);
    }

    #[test]
    fn validate_number_range() {
        let param = Parameter::number("SID", "sid", "255", 1, 255);
        assert!(param.validate("17").is_ok());
        assert!(matches!(
            param.validate("0"),
            Err(SubmissionError::OutOfRange { value: 0, .. })
        ));
        assert!(matches!(
            param.validate("x1"),
            Err(SubmissionError::NotANumber { .. })
        ));
        assert!(matches!(param.validate(" "), Err(SubmissionError::Empty { .. })));
    }

    #[test]
    fn validate_select_rejects_unknown() {
        let param = Parameter::select("Color", "color", COLORS, "1");
        assert!(param.validate("2").is_ok());
        assert!(matches!(
            param.validate("3"),
            Err(SubmissionError::UnknownChoice { .. })
        ));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let groups = vec![
            ParameterGroup::new("a", "A").with(Parameter::text("One", "dup", "", 8)),
            ParameterGroup::new("b", "B").with(Parameter::text("Two", "dup", "", 8)),
        ];
        assert!(matches!(
            ParameterSet::new(groups),
            Err(ConfigError::DuplicateKey(key)) if key == "dup"
        ));
    }

    #[test]
    fn reset_all_restores_defaults() {
        let mut set = ParameterSet::new(vec![ParameterGroup::new("g", "G")
            .with(Parameter::number("N", "n", "7", 0, 9))
            .with(Parameter::text("T", "t", "abc", 8).hidden())])
        .unwrap();

        set.set("n", "3").unwrap();
        set.set("t", "zzz").unwrap();
        set.reset_all();

        assert_eq!(set.value("n"), "7");
        assert_eq!(set.value("t"), "abc");
        assert!(!set.get("t").unwrap().is_visible());
        assert!(set.set("missing", "1").is_err());
    }
}
