//! Command-line parameters declared by a service, with their typed values and bounds.

use super::{is_false, Extra};
use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Declared parameter type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParamKind {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "string[]")]
    StringList,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::String => "string",
            Self::StringList => "string[]",
        }
    }
}

/// A parameter value as it appears in the document.
///
/// `List` also accepts the legacy comma-joined string form through `Text`;
/// see [`ParamValue::as_list`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    List(Vec<String>),
    Text(String),
}

impl ParamValue {
    /// List elements; a single string is split on commas and trimmed.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            Self::Text(joined) => joined
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Self::Bool(b) => vec![b.to_string()],
            Self::Int(i) => vec![i.to_string()],
        }
    }

    /// Scalar rendering used for `flag=value` emission.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(","),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    /// CLI flag including dashes, e.g. `--rpc-port`.
    pub flag: String,
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
    /// User-set value. Only parameters with a value are emitted.
    pub value: Option<ParamValue>,
    /// `flag=value` when true, `flag value` when false. Unset: equals for
    /// non-bool kinds.
    pub use_equals: Option<bool>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sensitive: bool,
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Parameter {
    pub fn new(name: impl Into<String>, flag: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            flag: flag.into(),
            kind,
            default: None,
            value: None,
            use_equals: None,
            min: None,
            max: None,
            choices: Vec::new(),
            required: false,
            hidden: false,
            sensitive: false,
            description: None,
            extra: Extra::new(),
        }
    }

    pub fn has_user_value(&self) -> bool {
        self.value.is_some()
    }

    /// Effective value: user value, then declared default.
    pub fn effective(&self) -> Option<&ParamValue> {
        self.value.as_ref().or(self.default.as_ref())
    }

    pub fn equals_syntax(&self) -> bool {
        self.use_equals.unwrap_or(self.kind != ParamKind::Bool)
    }

    /// Value for display; sensitive values are masked.
    pub fn display_value(&self) -> Option<String> {
        self.effective().map(|v| {
            if self.sensitive {
                "***".to_string()
            } else {
                v.render()
            }
        })
    }

    /// Parse raw operator input into a typed value for this parameter.
    pub fn parse(&self, raw: &str) -> Result<ParamValue> {
        let raw = raw.trim();
        let value = match self.kind {
            ParamKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => ParamValue::Bool(true),
                "false" | "no" | "off" | "0" => ParamValue::Bool(false),
                _ => {
                    return Err(ServiceError::Validation(format!(
                        "{}: expected a boolean, got '{raw}'",
                        self.name
                    )))
                }
            },
            ParamKind::Int => raw.parse::<i64>().map(ParamValue::Int).map_err(|_| {
                ServiceError::Validation(format!("{}: expected an integer, got '{raw}'", self.name))
            })?,
            ParamKind::String => ParamValue::Text(raw.to_string()),
            ParamKind::StringList => ParamValue::List(ParamValue::Text(raw.to_string()).as_list()),
        };
        self.validate(&value)?;
        Ok(value)
    }

    /// Check type, integer bounds and enum choices.
    pub fn validate(&self, value: &ParamValue) -> Result<()> {
        let type_ok = matches!(
            (self.kind, value),
            (ParamKind::Bool, ParamValue::Bool(_))
                | (ParamKind::Int, ParamValue::Int(_))
                | (ParamKind::String, ParamValue::Text(_))
                | (ParamKind::StringList, ParamValue::List(_))
                | (ParamKind::StringList, ParamValue::Text(_))
        );
        if !type_ok {
            return Err(ServiceError::Validation(format!(
                "{}: value does not match type {}",
                self.name,
                self.kind.as_str()
            )));
        }

        if let ParamValue::Int(n) = value {
            if let Some(min) = self.min {
                if *n < min {
                    return Err(ServiceError::Validation(format!(
                        "{}: {n} is below the minimum {min}",
                        self.name
                    )));
                }
            }
            if let Some(max) = self.max {
                if *n > max {
                    return Err(ServiceError::Validation(format!(
                        "{}: {n} is above the maximum {max}",
                        self.name
                    )));
                }
            }
        }

        if !self.choices.is_empty() {
            let candidates = match (self.kind, value) {
                (ParamKind::StringList, v) => v.as_list(),
                (_, v) => vec![v.render()],
            };
            if let Some(bad) = candidates.iter().find(|c| !self.choices.contains(c)) {
                return Err(ServiceError::Validation(format!(
                    "{}: '{bad}' is not one of [{}]",
                    self.name,
                    self.choices.join(", ")
                )));
            }
        }
        Ok(())
    }
}
