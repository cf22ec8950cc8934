use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::fmt;

/// A typed field value of a resource definition.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    String(String),
    List(Vec<FieldValue>),
    Map(IndexMap<String, FieldValue>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) => match s.as_str() {
                "true" | "on" => Some(true),
                "false" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, FieldValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Encode as a vendor request parameter.
    pub fn to_param(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::String(s) => s.clone(),
            Self::List(_) | Self::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// Normalize a vendor response value.
    ///
    /// Integral floats become integers, objects wrapping a single list
    /// (`{"UserCidr": [..]}`) collapse into that list and `null` is dropped.
    pub fn from_vendor(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Self::Integer)
                .or_else(|| Some(Self::String(n.to_string()))),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(items) => Some(Self::List(
                items.iter().filter_map(Self::from_vendor).collect(),
            )),
            Value::Object(map) => match map.values().collect::<Vec<_>>().as_slice() {
                [inner @ Value::Array(_)] => Self::from_vendor(inner),
                _ => Some(Self::Map(
                    map.iter()
                        .filter_map(|(k, v)| Self::from_vendor(v).map(|v| (k.clone(), v)))
                        .collect(),
                )),
            },
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_param())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

/// Field name to value mapping of a resource.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct FieldMap(IndexMap<String, FieldValue>);

/// What the user declared.
pub type DesiredState = FieldMap;

/// What the vendor last reported, keyed by declarative field name.
pub type ObservedState = FieldMap;

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    /// Present and not an empty string.
    pub fn get_set(&self, field: &str) -> Option<&FieldValue> {
        self.get(field)
            .filter(|v| !matches!(v, FieldValue::String(s) if s.is_empty()))
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(FieldValue::as_i64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(FieldValue::as_bool)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn insert<K: Into<String>, V: Into<FieldValue>>(&mut self, field: K, value: V) {
        self.0.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.0.shift_remove(field)
    }

    pub fn with<K: Into<String>, V: Into<FieldValue>>(mut self, field: K, value: V) -> Self {
        self.insert(field, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Desired fields whose value differs from the last observed one.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct ChangeSet(IndexSet<String>);

impl ChangeSet {
    /// Compare two snapshots. A desired field missing from the observed state
    /// counts as changed, observed-only fields are ignored.
    pub fn between(desired: &DesiredState, observed: &ObservedState) -> Self {
        Self(
            desired
                .iter()
                .filter(|(field, value)| observed.get(field) != Some(*value))
                .map(|(field, _)| field.clone())
                .collect(),
        )
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains(field)
    }

    pub fn contains_any(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.contains(f))
    }

    pub fn insert<S: Into<String>>(&mut self, field: S) {
        self.0.insert(field.into());
    }

    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.0.retain(|f| keep(f));
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ChangeSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.iter().collect();
        write!(f, "[{}]", fields.join(", "))
    }
}
