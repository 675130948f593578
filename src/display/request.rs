use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Error, HalfSeconds, Result};

/// One mode ("S*") record: how presses map to actions in a given state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRecord {
    pub state: u8,
    /// Alert state this record's wakeup list applies to
    pub alert: u8,
    #[serde(rename = "SingleLeft", default, skip_serializing_if = "Option::is_none")]
    pub single_left: Option<u8>,
    #[serde(rename = "SingleRight", default, skip_serializing_if = "Option::is_none")]
    pub single_right: Option<u8>,
    #[serde(rename = "DoubleLeft", default, skip_serializing_if = "Option::is_none")]
    pub double_left: Option<u8>,
    #[serde(rename = "DoubleRight", default, skip_serializing_if = "Option::is_none")]
    pub double_right: Option<u8>,
    #[serde(rename = "messageValue", default, skip_serializing_if = "Option::is_none")]
    pub message_value: Option<u8>,
    #[serde(rename = "messageState", default, skip_serializing_if = "Option::is_none")]
    pub message_state: Option<u8>,
    /// Delay before the delay action, in seconds
    #[serde(rename = "delayValue", default, skip_serializing_if = "Option::is_none")]
    pub delay_value: Option<u32>,
    #[serde(rename = "delayState", default, skip_serializing_if = "Option::is_none")]
    pub delay_state: Option<u8>,
    #[serde(rename = "appValue", default, skip_serializing_if = "Option::is_none")]
    pub app_value: Option<u8>,
    #[serde(rename = "appState", default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<u8>,
    /// Successive sleep intervals for the node while in `alert` state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wakeup: Option<Vec<HalfSeconds>>,
}

/// A single typed config field
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSegment {
    /// Node name, shown on the name page
    Name(String),
    /// Display page `D<n>` with its (decoded) text
    Screen { selector: u8, text: String },
    /// Mode record `S*`
    Mode(ModeRecord),
    /// Context value applied once everything else is on the device
    AppValue(u8),
    /// Node is being moved between gateways; longest delay it may sleep, in seconds
    Reassign(u32),
    /// Display-only update
    Update,
    /// Field this gateway does not encode
    Other(Value),
}

impl ConfigSegment {
    /// Parses one field of a management config object
    pub fn parse(key: &str, value: &Value) -> Result<Self> {
        match key {
            "name" => value
                .as_str()
                .map(|name| ConfigSegment::Name(name.to_string()))
                .ok_or_else(|| Error::config("name must be a string")),
            "app_value" => as_u8(value)
                .map(ConfigSegment::AppValue)
                .ok_or_else(|| Error::config("app_value must be a byte")),
            "reassign" => value
                .as_u64()
                .and_then(|delay| u32::try_from(delay).ok())
                .map(ConfigSegment::Reassign)
                .ok_or_else(|| Error::config("reassign must be a delay in seconds")),
            "update" => Ok(ConfigSegment::Update),
            _ if key.starts_with('D') => {
                let selector = key[1..]
                    .parse::<u8>()
                    .map_err(|_| Error::config(format!("invalid screen selector {}", key)))?;
                let encoded = value
                    .as_str()
                    .ok_or_else(|| Error::config(format!("{} must be a base64 string", key)))?;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::config(format!("{} is not valid base64: {}", key, e)))?;
                let text = String::from_utf8_lossy(&decoded).into_owned();
                Ok(ConfigSegment::Screen { selector, text })
            }
            _ if key.starts_with('S') => {
                let record: ModeRecord = serde_json::from_value(value.clone())?;
                Ok(ConfigSegment::Mode(record))
            }
            _ => Ok(ConfigSegment::Other(value.clone())),
        }
    }
}

fn as_u8(value: &Value) -> Option<u8> {
    value.as_u64().and_then(|v| u8::try_from(v).ok())
}

/// Config fields in the order they were received
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFields {
    entries: Vec<(String, ConfigSegment)>,
}

impl ConfigFields {
    /// Creates an empty field set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a management config object, keeping its key order
    pub fn from_json(map: &Map<String, Value>) -> Result<Self> {
        let mut fields = ConfigFields::new();
        for (key, value) in map {
            fields.insert(key.clone(), ConfigSegment::parse(key, value)?);
        }
        Ok(fields)
    }

    /// Inserts a field; an existing key keeps its position and takes the new value
    pub fn insert(&mut self, key: impl Into<String>, segment: ConfigSegment) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = segment,
            None => self.entries.push((key, segment)),
        }
    }

    /// Looks up a field by key
    pub fn get(&self, key: &str) -> Option<&ConfigSegment> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, s)| s)
    }

    /// Whether a field is present
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Fields in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigSegment)> {
        self.entries.iter().map(|(k, s)| (k.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reassign delay, if this config moves the node between gateways
    pub fn reassign(&self) -> Option<u32> {
        self.entries.iter().find_map(|(_, s)| match s {
            ConfigSegment::Reassign(delay) => Some(*delay),
            _ => None,
        })
    }

    /// Whether this is a display-only update
    pub fn is_update(&self) -> bool {
        self.entries.iter().any(|(_, s)| matches!(s, ConfigSegment::Update))
    }

    fn has_name(&self) -> bool {
        self.entries.iter().any(|(_, s)| matches!(s, ConfigSegment::Name(_)))
    }

    fn update(&mut self, other: ConfigFields) {
        for (key, segment) in other.entries {
            self.insert(key, segment);
        }
    }
}

/// Pending display/config update for one node
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigRequest {
    /// Complete configuration; replaces anything pending
    Full(ConfigFields),
    /// Fields merged into whatever is pending
    Partial(ConfigFields),
}

impl ConfigRequest {
    /// Classifies received fields: a name makes the request complete
    pub fn from_fields(fields: ConfigFields) -> Self {
        if fields.has_name() {
            ConfigRequest::Full(fields)
        } else {
            ConfigRequest::Partial(fields)
        }
    }

    /// Parses a management config object
    pub fn from_json(map: &Map<String, Value>) -> Result<Self> {
        ConfigFields::from_json(map).map(ConfigRequest::from_fields)
    }

    /// Combines a pending request with a newly received one.
    ///
    /// A full request replaces whatever is pending. A partial request updates
    /// the pending fields in place and keeps the pending request's kind.
    pub fn merge(pending: Option<ConfigRequest>, incoming: ConfigRequest) -> ConfigRequest {
        match (pending, incoming) {
            (_, full @ ConfigRequest::Full(_)) => full,
            (None, partial) => partial,
            (Some(ConfigRequest::Full(mut fields)), ConfigRequest::Partial(update)) => {
                fields.update(update);
                ConfigRequest::Full(fields)
            }
            (Some(ConfigRequest::Partial(mut fields)), ConfigRequest::Partial(update)) => {
                fields.update(update);
                ConfigRequest::Partial(fields)
            }
        }
    }

    /// Fields of this request
    pub fn fields(&self) -> &ConfigFields {
        match self {
            ConfigRequest::Full(fields) | ConfigRequest::Partial(fields) => fields,
        }
    }

    /// Whether the config reassigns the node; such configs are never transmitted
    pub fn is_reassign(&self) -> bool {
        self.fields().reassign().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_parse_segments() {
        let request = ConfigRequest::from_json(&map(json!({
            "name": "Kitchen",
            "D1": base64::engine::general_purpose::STANDARD.encode("Hello\n*World"),
            "S0": {"state": 0, "alert": 0, "SingleLeft": 1, "wakeup": [60, 120]},
            "app_value": 3
        })))
        .unwrap();

        assert!(matches!(request, ConfigRequest::Full(_)));
        let fields = request.fields();
        assert_eq!(fields.get("name"), Some(&ConfigSegment::Name("Kitchen".into())));
        assert_eq!(
            fields.get("D1"),
            Some(&ConfigSegment::Screen { selector: 1, text: "Hello\n*World".into() })
        );
        match fields.get("S0") {
            Some(ConfigSegment::Mode(record)) => {
                assert_eq!(record.single_left, Some(1));
                assert_eq!(record.double_left, None);
                assert_eq!(record.wakeup, Some(vec![HalfSeconds(60), HalfSeconds(120)]));
            }
            other => panic!("unexpected {:?}", other),
        }
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["name", "D1", "S0", "app_value"]);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(ConfigRequest::from_json(&map(json!({"D2": "***not base64***"}))).is_err());
        assert!(ConfigRequest::from_json(&map(json!({"app_value": 300}))).is_err());
        assert!(ConfigRequest::from_json(&map(json!({"S1": {"state": 1}}))).is_err());
        assert!(ConfigRequest::from_json(&map(json!({"Dx": "AA=="}))).is_err());
    }

    #[test]
    fn test_partial_merges_into_full() {
        let full = ConfigRequest::from_json(&map(json!({"name": "X"}))).unwrap();
        let partial = ConfigRequest::from_json(&map(json!({"app_value": 3}))).unwrap();
        assert!(matches!(partial, ConfigRequest::Partial(_)));

        let merged = ConfigRequest::merge(Some(full), partial);
        assert!(matches!(merged, ConfigRequest::Full(_)));
        assert_eq!(merged.fields().len(), 2);
        assert_eq!(merged.fields().get("app_value"), Some(&ConfigSegment::AppValue(3)));
    }

    #[test]
    fn test_partial_overwrites_in_place() {
        let first = ConfigRequest::from_json(&map(json!({"app_value": 1, "update": true}))).unwrap();
        let second = ConfigRequest::from_json(&map(json!({"app_value": 2}))).unwrap();
        let merged = ConfigRequest::merge(Some(first), second);

        let keys: Vec<&str> = merged.fields().iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["app_value", "update"]);
        assert_eq!(merged.fields().get("app_value"), Some(&ConfigSegment::AppValue(2)));
        assert!(merged.fields().is_update());
    }

    #[test]
    fn test_name_replaces_stale_partial() {
        let stale = ConfigRequest::from_json(&map(json!({"app_value": 1}))).unwrap();
        let full = ConfigRequest::from_json(&map(json!({"name": "Y"}))).unwrap();
        let merged = ConfigRequest::merge(Some(stale), full);
        assert_eq!(merged.fields().len(), 1);
        assert!(!merged.fields().contains("app_value"));
    }

    #[test]
    fn test_reassign() {
        let request = ConfigRequest::from_json(&map(json!({"reassign": 900}))).unwrap();
        assert!(request.is_reassign());
        assert_eq!(request.fields().reassign(), Some(900));
    }
}
