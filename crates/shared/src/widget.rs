use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{FormId, WidgetId};

/// Value carried by a widget. The variant is the widget's value kind; the host
/// fixes it when it declares the widget and it never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WidgetValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    StringArray(Vec<String>),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    /// Serialized JSON document, kept as text so the host sees exactly what was set.
    Json(String),
    Bytes(Vec<u8>),
    /// One-shot flag (buttons). Reverts to `false` once delivered.
    Trigger(bool),
    /// One-shot text payload (chat-style inputs). Reverts to `None` once delivered.
    StringTrigger(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Bool,
    Int,
    Double,
    String,
    StringArray,
    IntArray,
    DoubleArray,
    Json,
    Bytes,
    Trigger,
    StringTrigger,
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WidgetKind::Bool => "bool",
            WidgetKind::Int => "int",
            WidgetKind::Double => "double",
            WidgetKind::String => "string",
            WidgetKind::StringArray => "string_array",
            WidgetKind::IntArray => "int_array",
            WidgetKind::DoubleArray => "double_array",
            WidgetKind::Json => "json",
            WidgetKind::Bytes => "bytes",
            WidgetKind::Trigger => "trigger",
            WidgetKind::StringTrigger => "string_trigger",
        };
        f.write_str(name)
    }
}

impl WidgetValue {
    pub fn kind(&self) -> WidgetKind {
        match self {
            WidgetValue::Bool(_) => WidgetKind::Bool,
            WidgetValue::Int(_) => WidgetKind::Int,
            WidgetValue::Double(_) => WidgetKind::Double,
            WidgetValue::String(_) => WidgetKind::String,
            WidgetValue::StringArray(_) => WidgetKind::StringArray,
            WidgetValue::IntArray(_) => WidgetKind::IntArray,
            WidgetValue::DoubleArray(_) => WidgetKind::DoubleArray,
            WidgetValue::Json(_) => WidgetKind::Json,
            WidgetValue::Bytes(_) => WidgetKind::Bytes,
            WidgetValue::Trigger(_) => WidgetKind::Trigger,
            WidgetValue::StringTrigger(_) => WidgetKind::StringTrigger,
        }
    }

    /// Checks the value against the rules of its own kind.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            WidgetValue::Double(value) if !value.is_finite() => {
                Err(format!("double value must be finite, got {value}"))
            }
            WidgetValue::DoubleArray(values) => match values.iter().find(|v| !v.is_finite()) {
                Some(value) => Err(format!("double array contains non-finite value {value}")),
                None => Ok(()),
            },
            WidgetValue::Json(raw) => serde_json::from_str::<serde_json::Value>(raw)
                .map(|_| ())
                .map_err(|err| format!("json value is malformed: {err}")),
            _ => Ok(()),
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            WidgetValue::Trigger(_) | WidgetValue::StringTrigger(_)
        )
    }

    /// Resting value of a one-shot trigger; `None` for every other kind.
    pub fn trigger_idle(&self) -> Option<WidgetValue> {
        match self {
            WidgetValue::Trigger(_) => Some(WidgetValue::Trigger(false)),
            WidgetValue::StringTrigger(_) => Some(WidgetValue::StringTrigger(None)),
            _ => None,
        }
    }
}

/// A widget's value as reported to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetState {
    pub widget_id: WidgetId,
    pub value: WidgetValue,
}

/// Host-side declaration of a widget emitted while the script runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetDeclaration {
    pub widget_id: WidgetId,
    pub default: WidgetValue,
    /// Current value the host wants shown; falls back to `default` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<WidgetValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<FormId>,
}
