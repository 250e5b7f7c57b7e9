//! Parameter schemas
//!
//! Every capability declares an ordered list of typed parameters. Parameter
//! bags are checked here at plan-build time and again after bindings are
//! filled, never deep inside a handler.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
        .expect("email regex must compile")
});

static EMAIL_IN_TEXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}")
        .expect("email search regex must compile")
});

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+[1-9]\d{6,14}$").expect("phone regex must compile"));

static PHONE_IN_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+[1-9]\d{6,14}\b").expect("phone search regex must compile"));

/// Kind of person identity a parameter carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Email,
    Phone,
}

impl IdentityKind {
    /// Whether `value` already is a canonical identifier of this kind
    pub fn is_canonical(&self, value: &str) -> bool {
        let value = value.trim();
        match self {
            IdentityKind::Email => EMAIL_RE.is_match(value),
            IdentityKind::Phone => PHONE_RE.is_match(value),
        }
    }

    /// First canonical identifier of this kind found in free text
    pub fn find_in(&self, text: &str) -> Option<String> {
        let re = match self {
            IdentityKind::Email => &*EMAIL_IN_TEXT_RE,
            IdentityKind::Phone => &*PHONE_IN_TEXT_RE,
        };
        re.find(text).map(|m| m.as_str().to_string())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityKind::Email => "email",
            IdentityKind::Phone => "phone",
        }
    }
}

impl std::str::FromStr for IdentityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "email" => Ok(IdentityKind::Email),
            "phone" => Ok(IdentityKind::Phone),
            other => Err(format!("unknown identity kind '{}'", other)),
        }
    }
}

/// Parameter value type
///
/// Serialized as a plain string: `string`, `text`, `integer`, `boolean`,
/// `array`, `object`, `identity:email`, `identity:phone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParamKind {
    /// Short single-token value
    String,
    /// Free text, may span the rest of a clause
    Text,
    Integer,
    Boolean,
    Array,
    Object,
    Identity(IdentityKind),
}

impl ParamKind {
    pub fn identity(&self) -> Option<IdentityKind> {
        match self {
            ParamKind::Identity(kind) => Some(*kind),
            _ => None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String | ParamKind::Text | ParamKind::Identity(_) => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::String => f.write_str("string"),
            ParamKind::Text => f.write_str("text"),
            ParamKind::Integer => f.write_str("integer"),
            ParamKind::Boolean => f.write_str("boolean"),
            ParamKind::Array => f.write_str("array"),
            ParamKind::Object => f.write_str("object"),
            ParamKind::Identity(kind) => write!(f, "identity:{}", kind.as_str()),
        }
    }
}

impl TryFrom<String> for ParamKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "string" => Ok(ParamKind::String),
            "text" => Ok(ParamKind::Text),
            "integer" => Ok(ParamKind::Integer),
            "boolean" => Ok(ParamKind::Boolean),
            "array" => Ok(ParamKind::Array),
            "object" => Ok(ParamKind::Object),
            other => match other.strip_prefix("identity:") {
                Some(kind) => kind.parse().map(ParamKind::Identity),
                None => Err(format!("unknown parameter kind '{}'", other)),
            },
        }
    }
}

impl From<ParamKind> for String {
    fn from(kind: ParamKind) -> Self {
        kind.to_string()
    }
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    /// Words that introduce this parameter's value in an utterance ("to", "about")
    #[serde(default)]
    pub cues: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            cues: Vec::new(),
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_cues(mut self, cues: &[&str]) -> Self {
        self.cues = cues.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("parameters must be an object")]
    NotAnObject,

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    #[error("parameter '{param}' must be {expected}")]
    TypeMismatch { param: String, expected: ParamKind },

    #[error("parameter '{param}' must be a valid {kind} address, got '{value}'")]
    NonCanonical {
        param: String,
        kind: &'static str,
        value: String,
    },
}

/// Ordered parameter list of one capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema {
    pub params: Vec<ParamSpec>,
}

impl ParameterSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Identity parameters in declaration order
    pub fn identity_params(&self) -> impl Iterator<Item = (&ParamSpec, IdentityKind)> {
        self.params
            .iter()
            .filter_map(|p| p.kind.identity().map(|kind| (p, kind)))
    }

    /// Validate a parameter bag. Names in `bound` are filled later from
    /// upstream outputs and count as present.
    pub fn validate(&self, params: &Value, bound: &[&str]) -> Result<(), SchemaError> {
        let empty = serde_json::Map::new();
        let map = match params {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(SchemaError::NotAnObject),
        };

        for key in map.keys() {
            if self.get(key).is_none() {
                return Err(SchemaError::UnknownParameter(key.clone()));
            }
        }

        for spec in &self.params {
            match map.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required && !bound.contains(&spec.name.as_str()) {
                        return Err(SchemaError::MissingRequired(spec.name.clone()));
                    }
                }
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(SchemaError::TypeMismatch {
                            param: spec.name.clone(),
                            expected: spec.kind,
                        });
                    }
                    if let (Some(kind), Some(text)) = (spec.kind.identity(), value.as_str()) {
                        if !kind.is_canonical(text) {
                            return Err(SchemaError::NonCanonical {
                                param: spec.name.clone(),
                                kind: kind.as_str(),
                                value: text.to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
