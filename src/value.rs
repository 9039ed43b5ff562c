//! Property value model.
//!
//! A closed, tagged union of every value kind a node property can hold, with
//! explicit conversion rules between kinds. Binary values are carried by
//! reference (an identifier into external binary storage), never inline.

use crate::error::RepositoryError;
use crate::types::NodeKey;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a binary stored outside the document population.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryRef(pub String);

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Binary(BinaryRef),
    Name(String),
    Path(String),
    Reference(NodeKey),
    WeakReference(NodeKey),
}

impl PropertyValue {
    /// The kind name, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Long(_) => "long",
            PropertyValue::Double(_) => "double",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Date(_) => "date",
            PropertyValue::Binary(_) => "binary",
            PropertyValue::Name(_) => "name",
            PropertyValue::Path(_) => "path",
            PropertyValue::Reference(_) => "reference",
            PropertyValue::WeakReference(_) => "weak-reference",
        }
    }

    fn conversion_error(&self, to: &'static str) -> RepositoryError {
        RepositoryError::ValueConversion {
            from: self.kind(),
            to,
        }
    }

    /// Render as a string. Every kind has a canonical string form, so this
    /// conversion is total.
    pub fn as_string(&self) -> String {
        match self {
            PropertyValue::String(s) | PropertyValue::Name(s) | PropertyValue::Path(s) => s.clone(),
            PropertyValue::Long(v) => v.to_string(),
            PropertyValue::Double(v) => v.to_string(),
            PropertyValue::Boolean(v) => v.to_string(),
            PropertyValue::Date(v) => v.to_rfc3339(),
            PropertyValue::Binary(BinaryRef(id)) => id.clone(),
            PropertyValue::Reference(key) | PropertyValue::WeakReference(key) => key.to_string(),
        }
    }

    /// Convert to a long. Strings parse, doubles truncate, dates become
    /// epoch milliseconds; anything else is a conversion error.
    pub fn as_long(&self) -> Result<i64, RepositoryError> {
        match self {
            PropertyValue::Long(v) => Ok(*v),
            PropertyValue::Double(v) => Ok(*v as i64),
            PropertyValue::String(s) => {
                s.parse::<i64>().map_err(|_| self.conversion_error("long"))
            }
            PropertyValue::Date(v) => Ok(v.timestamp_millis()),
            _ => Err(self.conversion_error("long")),
        }
    }

    /// Convert to a double. Strings parse, longs widen, dates become epoch
    /// milliseconds.
    pub fn as_double(&self) -> Result<f64, RepositoryError> {
        match self {
            PropertyValue::Double(v) => Ok(*v),
            PropertyValue::Long(v) => Ok(*v as f64),
            PropertyValue::String(s) => s
                .parse::<f64>()
                .map_err(|_| self.conversion_error("double")),
            PropertyValue::Date(v) => Ok(v.timestamp_millis() as f64),
            _ => Err(self.conversion_error("double")),
        }
    }

    /// Convert to a boolean. Only booleans and the literal strings
    /// "true"/"false" convert.
    pub fn as_boolean(&self) -> Result<bool, RepositoryError> {
        match self {
            PropertyValue::Boolean(v) => Ok(*v),
            PropertyValue::String(s) => match s.as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(self.conversion_error("boolean")),
            },
            _ => Err(self.conversion_error("boolean")),
        }
    }

    /// Convert to a date. Strings parse as RFC 3339, longs are epoch
    /// milliseconds.
    pub fn as_date(&self) -> Result<DateTime<Utc>, RepositoryError> {
        match self {
            PropertyValue::Date(v) => Ok(*v),
            PropertyValue::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| self.conversion_error("date")),
            PropertyValue::Long(millis) => Utc
                .timestamp_millis_opt(*millis)
                .single()
                .ok_or_else(|| self.conversion_error("date")),
            _ => Err(self.conversion_error("date")),
        }
    }

    /// Convert to a node reference. Both strong and weak references convert.
    pub fn as_reference(&self) -> Result<&NodeKey, RepositoryError> {
        match self {
            PropertyValue::Reference(key) | PropertyValue::WeakReference(key) => Ok(key),
            _ => Err(self.conversion_error("reference")),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}
