//! Typed per-filter property collections.
//!
//! Filters declare properties with a name, a default value, a help text
//! and optional constraints. The runtime stores the values in memory and
//! forwards every change to the owning filter on its thread via
//! `Filter::on_property_changed`; persistent storage is a host concern.

use crate::filter::FilterId;
use crate::graph::thread::ThreadEvent;
use crate::{FlowgraphError, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::String(_) => "string",
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

/// Optional constraints on a property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyOptions {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Allowed values for string properties.
    pub enum_values: Option<Vec<String>>,
}

struct Property {
    value: PropertyValue,
    default: PropertyValue,
    help: String,
    options: PropertyOptions,
}

/// Typed property collection of one filter.
pub struct PropertyCollection {
    name: String,
    entries: Mutex<HashMap<String, Property>>,
    /// Set when the collection is attached to a running graph; changes
    /// are forwarded to this filter's thread.
    subscriber: Mutex<Option<(FilterId, Sender<ThreadEvent>)>>,
}

impl PropertyCollection {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            subscriber: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a property and return its current value, or return the
    /// stored value if it is already declared. This is the accessor
    /// filters call from their factory.
    pub fn get_property(
        &self,
        name: &str,
        default: impl Into<PropertyValue>,
        help: &str,
    ) -> PropertyValue {
        let default = default.into();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(name.to_string())
            .or_insert_with(|| Property {
                value: default.clone(),
                default,
                help: help.to_string(),
                options: PropertyOptions::default(),
            })
            .value
            .clone()
    }

    /// Declare a property with constraints. Fails if the default itself
    /// violates them or the property exists already.
    pub fn declare_property(
        &self,
        name: &str,
        default: impl Into<PropertyValue>,
        help: &str,
        options: PropertyOptions,
    ) -> Result<()> {
        let default = default.into();
        validate(name, &default, &options)?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(name) {
            return Err(FlowgraphError::InvalidArgument(format!(
                "property '{name}' is already declared"
            )));
        }
        entries.insert(
            name.to_string(),
            Property {
                value: default.clone(),
                default,
                help: help.to_string(),
                options,
            },
        );
        Ok(())
    }

    /// Current value of a declared property.
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|p| p.value.clone())
    }

    /// Default value of a declared property.
    pub fn default_value(&self, name: &str) -> Option<PropertyValue> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|p| p.default.clone())
    }

    /// Help text of a declared property.
    pub fn help(&self, name: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|p| p.help.clone())
    }

    /// Set a declared property. The new value must match the declared
    /// type and constraints. The owning filter is notified on its thread.
    pub fn set_property(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let prop = entries.get_mut(name).ok_or_else(|| {
                FlowgraphError::InvalidArgument(format!("property '{name}' is not declared"))
            })?;
            if std::mem::discriminant(&prop.value) != std::mem::discriminant(&value) {
                return Err(FlowgraphError::InvalidArgument(format!(
                    "property '{name}' is of type {}, got {}",
                    prop.value.type_name(),
                    value.type_name()
                )));
            }
            validate(name, &value, &prop.options)?;
            if prop.value == value {
                return Ok(());
            }
            prop.value = value;
        }
        let subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((filter, tx)) = subscriber.as_ref() {
            let _ = tx.send(ThreadEvent::PropertyChanged {
                filter: *filter,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Names of all declared properties.
    pub fn property_names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn attach(&self, filter: FilterId, tx: Sender<ThreadEvent>) {
        *self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((filter, tx));
    }
}

fn validate(name: &str, value: &PropertyValue, options: &PropertyOptions) -> Result<()> {
    if let Some(num) = value.as_float() {
        if let Some(min) = options.min {
            if num < min {
                return Err(FlowgraphError::InvalidArgument(format!(
                    "property '{name}': {num} is below the minimum {min}"
                )));
            }
        }
        if let Some(max) = options.max {
            if num > max {
                return Err(FlowgraphError::InvalidArgument(format!(
                    "property '{name}': {num} is above the maximum {max}"
                )));
            }
        }
    }
    if let (Some(s), Some(allowed)) = (value.as_str(), options.enum_values.as_ref()) {
        if !allowed.iter().any(|a| a == s) {
            return Err(FlowgraphError::InvalidArgument(format!(
                "property '{name}': '{s}' is not one of the allowed values"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_get_property_declares_default() {
        let pc = PropertyCollection::new("f");
        assert_eq!(pc.get_property("rate", 10i64, "sample rate"), 10i64.into());
        pc.set_property("rate", 20i64).unwrap();
        // Re-declaration keeps the stored value.
        assert_eq!(pc.get_property("rate", 10i64, "sample rate"), 20i64.into());
        assert_eq!(pc.default_value("rate"), Some(10i64.into()));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let pc = PropertyCollection::new("f");
        pc.get_property("rate", 10i64, "");
        assert!(pc.set_property("rate", "fast").is_err());
        assert!(pc.set_property("unknown", 1i64).is_err());
    }

    #[test]
    fn test_range_validation() {
        let pc = PropertyCollection::new("f");
        pc.declare_property(
            "gain",
            1.0,
            "gain factor",
            PropertyOptions {
                min: Some(0.0),
                max: Some(2.0),
                enum_values: None,
            },
        )
        .unwrap();
        assert!(pc.set_property("gain", 1.5).is_ok());
        assert!(pc.set_property("gain", -0.5).is_err());
        assert!(pc.set_property("gain", 2.5).is_err());
    }

    #[test]
    fn test_enum_validation() {
        let pc = PropertyCollection::new("f");
        pc.declare_property(
            "mode",
            "slow",
            "processing mode",
            PropertyOptions {
                min: None,
                max: None,
                enum_values: Some(vec!["slow".into(), "fast".into()]),
            },
        )
        .unwrap();
        assert!(pc.set_property("mode", "fast").is_ok());
        assert!(pc.set_property("mode", "warp").is_err());
    }

    #[test]
    fn test_change_notification() {
        let pc = PropertyCollection::new("f");
        pc.get_property("rate", 10i64, "");
        let (tx, rx) = unbounded();
        pc.attach(FilterId(3), tx);

        pc.set_property("rate", 11i64).unwrap();
        match rx.try_recv().unwrap() {
            ThreadEvent::PropertyChanged { filter, name } => {
                assert_eq!(filter, FilterId(3));
                assert_eq!(name, "rate");
            }
            _ => panic!("unexpected event"),
        }

        // Unchanged writes do not notify.
        pc.set_property("rate", 11i64).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
