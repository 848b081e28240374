// Parameter Model
// Tagged parameter values, declared kinds and bind-time kind checking

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Declared kind of a parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    #[default]
    String,
    Array,
    Object,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::String => write!(f, "string"),
            ParamKind::Array => write!(f, "array"),
            ParamKind::Object => write!(f, "object"),
        }
    }
}

/// A concrete parameter or result value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    Array(Vec<String>),
    Object(BTreeMap<String, String>),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::String(_) => ParamKind::String,
            ParamValue::Array(_) => ParamKind::Array,
            ParamValue::Object(_) => ParamKind::Object,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[String]> {
        match self {
            ParamValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            ParamValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Render the value as a single string.
    ///
    /// Strings are returned verbatim; arrays and objects render as JSON.
    pub fn render(&self) -> String {
        match self {
            ParamValue::String(s) => s.clone(),
            ParamValue::Array(items) => serde_json::to_string(items).unwrap_or_default(),
            ParamValue::Object(map) => serde_json::to_string(map).unwrap_or_default(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::String(s)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        ParamValue::Array(items)
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(items: Vec<&str>) -> Self {
        ParamValue::Array(items.into_iter().map(String::from).collect())
    }
}

impl From<BTreeMap<String, String>> for ParamValue {
    fn from(map: BTreeMap<String, String>) -> Self {
        ParamValue::Object(map)
    }
}

/// Parameter declaration on a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,

    /// Declared kind (`string` when omitted)
    #[serde(rename = "type", default)]
    pub kind: ParamKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Value used when the run does not supply one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParamValue>,

    /// Allowed string values
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,

    /// Keys an object value must carry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            default: None,
            allowed: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn with_default(mut self, value: impl Into<ParamValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_allowed(mut self, values: &[&str]) -> Self {
        self.allowed = values.iter().map(|v| v.to_string()).collect();
        self
    }

    /// Check a supplied value against this declaration
    pub fn check(&self, value: &ParamValue) -> Result<(), String> {
        if value.kind() != self.kind {
            return Err(format!(
                "expected a value of type {}, got {}",
                self.kind,
                value.kind()
            ));
        }

        if !self.allowed.is_empty() {
            let candidates: Vec<&str> = match value {
                ParamValue::String(s) => vec![s.as_str()],
                ParamValue::Array(items) => items.iter().map(String::as_str).collect(),
                ParamValue::Object(_) => Vec::new(),
            };
            if let Some(bad) = candidates
                .into_iter()
                .find(|c| !self.allowed.iter().any(|a| a == c))
            {
                return Err(format!(
                    "'{}' is not one of the allowed values [{}]",
                    bad,
                    self.allowed.join(", ")
                ));
            }
        }

        if let ParamValue::Object(map) = value {
            if let Some(missing) = self.properties.iter().find(|k| !map.contains_key(*k)) {
                return Err(format!("missing required key '{}'", missing));
            }
        }

        Ok(())
    }
}

/// A name/value binding on a task or matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Param {
    pub name: String,
    pub value: ParamValue,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_deserialization() {
        let s: ParamValue = serde_json::from_str(r#""prod""#).unwrap();
        assert_eq!(s, ParamValue::from("prod"));

        let a: ParamValue = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(a, ParamValue::from(vec!["a", "b"]));

        let o: ParamValue = serde_json::from_str(r#"{"url": "x"}"#).unwrap();
        assert_eq!(o.kind(), ParamKind::Object);
    }

    #[test]
    fn test_render() {
        assert_eq!(ParamValue::from("x").render(), "x");
        assert_eq!(ParamValue::from(vec!["a", "b"]).render(), r#"["a","b"]"#);
    }

    #[test]
    fn test_check_kind_mismatch() {
        let spec = ParamSpec::new("env", ParamKind::String);
        assert!(spec.check(&ParamValue::from("prod")).is_ok());
        let err = spec.check(&ParamValue::from(vec!["prod"])).unwrap_err();
        assert!(err.contains("expected a value of type string"));
    }

    #[test]
    fn test_check_allowed_values() {
        let spec = ParamSpec::new("env", ParamKind::String).with_allowed(&["prod", "staging"]);
        assert!(spec.check(&ParamValue::from("staging")).is_ok());
        assert!(spec.check(&ParamValue::from("dev")).is_err());
    }

    #[test]
    fn test_check_object_properties() {
        let mut spec = ParamSpec::new("repo", ParamKind::Object);
        spec.properties = vec!["url".to_string()];

        let mut map = BTreeMap::new();
        map.insert("branch".to_string(), "main".to_string());
        let err = spec.check(&ParamValue::Object(map.clone())).unwrap_err();
        assert!(err.contains("url"));

        map.insert("url".to_string(), "https://example.com".to_string());
        assert!(spec.check(&ParamValue::Object(map)).is_ok());
    }

    #[test]
    fn test_param_spec_yaml() {
        let yaml = r#"
name: targets
type: array
default: [a, b]
"#;
        let spec: ParamSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, ParamKind::Array);
        assert_eq!(spec.default, Some(ParamValue::from(vec!["a", "b"])));
    }
}
