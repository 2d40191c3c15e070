use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};

/// A decoded object emitted by a pipeline, or passed to it as a parameter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PsValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<PsValue>),
    Object(BTreeMap<String, PsValue>),
}

impl PsValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PsValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PsValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PsValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Property lookup on an object value.
    pub fn property(&self, name: &str) -> Option<&PsValue> {
        match self {
            PsValue::Object(props) => props.get(name),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PsValue::Null => "Null",
            PsValue::Bool(_) => "System.Boolean",
            PsValue::Int(_) => "System.Int64",
            PsValue::Float(_) => "System.Double",
            PsValue::String(_) => "System.String",
            PsValue::Array(_) => "System.Object[]",
            PsValue::Object(_) => "System.Management.Automation.PSCustomObject",
        }
    }
}

impl Display for PsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PsValue::Null => Ok(()),
            PsValue::Bool(true) => write!(f, "True"),
            PsValue::Bool(false) => write!(f, "False"),
            PsValue::Int(v) => write!(f, "{v}"),
            PsValue::Float(v) => write!(f, "{v}"),
            PsValue::String(s) => write!(f, "{s}"),
            PsValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            PsValue::Object(props) => {
                write!(f, "@{{")?;
                for (i, (name, value)) in props.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{name}={value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<&str> for PsValue {
    fn from(value: &str) -> Self {
        PsValue::String(value.to_owned())
    }
}

impl From<String> for PsValue {
    fn from(value: String) -> Self {
        PsValue::String(value)
    }
}

impl From<bool> for PsValue {
    fn from(value: bool) -> Self {
        PsValue::Bool(value)
    }
}

impl From<i32> for PsValue {
    fn from(value: i32) -> Self {
        PsValue::Int(i64::from(value))
    }
}

impl From<u32> for PsValue {
    fn from(value: u32) -> Self {
        PsValue::Int(i64::from(value))
    }
}

impl From<i64> for PsValue {
    fn from(value: i64) -> Self {
        PsValue::Int(value)
    }
}

impl From<f64> for PsValue {
    fn from(value: f64) -> Self {
        PsValue::Float(value)
    }
}

impl From<uuid::Uuid> for PsValue {
    fn from(value: uuid::Uuid) -> Self {
        PsValue::String(value.to_string())
    }
}

impl<T: Into<PsValue>> From<Vec<T>> for PsValue {
    fn from(values: Vec<T>) -> Self {
        PsValue::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<const N: usize> From<[&str; N]> for PsValue {
    fn from(values: [&str; N]) -> Self {
        PsValue::Array(values.into_iter().map(PsValue::from).collect())
    }
}

impl FromIterator<(String, PsValue)> for PsValue {
    fn from_iter<I: IntoIterator<Item = (String, PsValue)>>(iter: I) -> Self {
        PsValue::Object(iter.into_iter().collect())
    }
}

/// Where an error record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorOrigin {
    /// Reported by the remote side.
    #[default]
    Remote,
    /// Created locally from an unrecognized error-channel item.
    Synthetic,
    /// Appended when a pipeline completed with unread error content.
    DirtyPipeline,
}

#[derive(Debug, Clone, PartialEq, typed_builder::TypedBuilder, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The error message
    #[builder(setter(into))]
    pub message: String,
    /// The command name that caused the error
    #[builder(default, setter(strip_option, into))]
    pub command_name: Option<String>,
    /// The fully qualified error ID
    #[builder(default, setter(strip_option, into))]
    pub fully_qualified_error_id: Option<String>,
    /// The target object that caused the error
    #[builder(default, setter(strip_option, into))]
    pub target_object: Option<String>,
    /// Error category, e.g. `ObjectNotFound`
    #[builder(default, setter(strip_option, into))]
    pub category: Option<String>,
    #[builder(default)]
    pub origin: ErrorOrigin,
}

impl ErrorRecord {
    pub fn remote(message: impl Into<String>) -> Self {
        ErrorRecord::builder().message(message).build()
    }

    pub fn synthetic(message: impl Into<String>) -> Self {
        ErrorRecord::builder()
            .message(message)
            .origin(ErrorOrigin::Synthetic)
            .build()
    }

    pub fn dirty_pipeline(unread: usize) -> Self {
        ErrorRecord::builder()
            .message(format!(
                "pipeline completed with {unread} unread error record(s)"
            ))
            .fully_qualified_error_id("DirtyPipeline")
            .origin(ErrorOrigin::DirtyPipeline)
            .build()
    }

    pub fn is_dirty_pipeline(&self) -> bool {
        self.origin == ErrorOrigin::DirtyPipeline
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Raw content read from a pipeline's error channel, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorItem {
    Record(ErrorRecord),
    Object(PsValue),
    Null,
}

impl From<ErrorItem> for ErrorRecord {
    fn from(item: ErrorItem) -> Self {
        match item {
            ErrorItem::Record(record) => record,
            ErrorItem::Null | ErrorItem::Object(PsValue::Null) => {
                ErrorRecord::synthetic("null error")
            }
            ErrorItem::Object(value) => {
                ErrorRecord::synthetic(format!("error[{}] {value}", value.type_name()))
            }
        }
    }
}

impl From<ErrorRecord> for ErrorItem {
    fn from(record: ErrorRecord) -> Self {
        ErrorItem::Record(record)
    }
}

/// One element of a pipeline result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PsItem {
    Value(PsValue),
    Error(ErrorRecord),
}

impl PsItem {
    pub fn as_value(&self) -> Option<&PsValue> {
        match self {
            PsItem::Value(v) => Some(v),
            PsItem::Error(_) => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorRecord> {
        match self {
            PsItem::Error(e) => Some(e),
            PsItem::Value(_) => None,
        }
    }

    pub fn into_value(self) -> Option<PsValue> {
        match self {
            PsItem::Value(v) => Some(v),
            PsItem::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PsItem::Error(_))
    }
}

impl From<PsValue> for PsItem {
    fn from(value: PsValue) -> Self {
        PsItem::Value(value)
    }
}

impl From<ErrorRecord> for PsItem {
    fn from(record: ErrorRecord) -> Self {
        PsItem::Error(record)
    }
}
