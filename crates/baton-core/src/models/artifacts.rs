//! Typed step artifacts.
//!
//! Ledgers hand artifacts around as loosely shaped JSON, sometimes encoded
//! twice (a JSON string holding a JSON array). [`Artifacts::decode`] is the
//! single place that untangles this; everything past the boundary works on
//! the tagged union.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Nested string encodings deeper than this are treated as plain text.
const MAX_DECODE_DEPTH: usize = 4;

/// A produced media file (image, clip, audio track).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaArtifact {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Artifacts {
    #[default]
    Empty,
    /// Text prompts, typically one per downstream fan-out item.
    Prompts(Vec<String>),
    Media(Vec<MediaArtifact>),
    /// Anything that is neither of the above, kept verbatim.
    Json(Vec<Value>),
}

/// The artifact shape a fan-out step expects from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Prompts,
    Media,
    Json,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prompts => f.write_str("prompts"),
            Self::Media => f.write_str("media"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl Artifacts {
    /// Decode a raw artifact payload into its typed form.
    pub fn decode(raw: &Value) -> Self {
        decode_at(raw, 0)
    }

    /// Decode a list of raw values, e.g. a remote task's `output_artifacts`.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::decode(&Value::Array(values))
    }

    /// Concatenate several payloads in order and re-decode the result.
    pub fn concat(parts: Vec<Artifacts>) -> Self {
        let values: Vec<Value> = parts.iter().flat_map(|a| a.to_values()).collect();
        Self::from_values(values)
    }

    pub fn kind(&self) -> Option<ArtifactKind> {
        match self {
            Self::Empty => None,
            Self::Prompts(_) => Some(ArtifactKind::Prompts),
            Self::Media(_) => Some(ArtifactKind::Media),
            Self::Json(_) => Some(ArtifactKind::Json),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Prompts(p) => p.len(),
            Self::Media(m) => m.len(),
            Self::Json(j) => j.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten back into the wire shape (a JSON array).
    pub fn to_values(&self) -> Vec<Value> {
        match self {
            Self::Empty => Vec::new(),
            Self::Prompts(p) => p.iter().cloned().map(Value::String).collect(),
            Self::Media(m) => m
                .iter()
                .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
                .collect(),
            Self::Json(j) => j.clone(),
        }
    }

    /// Text form of each item, used to fill `${item}` in fan-out prompts.
    ///
    /// When `expected` is given the payload must have that kind; an empty
    /// payload always yields no items.
    pub fn items(&self, expected: Option<ArtifactKind>) -> Result<Vec<String>, String> {
        if let (Some(want), Some(got)) = (expected, self.kind()) {
            if want != got {
                return Err(format!("expected {} artifacts, got {}", want, got));
            }
        }
        Ok(match self {
            Self::Empty => Vec::new(),
            Self::Prompts(p) => p.clone(),
            Self::Media(m) => m.iter().map(|a| a.url.clone()).collect(),
            Self::Json(j) => j
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        })
    }
}

fn decode_at(raw: &Value, depth: usize) -> Artifacts {
    match raw {
        Value::Null => Artifacts::Empty,
        Value::String(s) if s.trim().is_empty() => Artifacts::Empty,
        Value::String(s) => {
            if depth < MAX_DECODE_DEPTH {
                if let Ok(inner) = serde_json::from_str::<Value>(s) {
                    if !inner.is_string() || inner.as_str() != Some(s.as_str()) {
                        return decode_at(&inner, depth + 1);
                    }
                }
            }
            Artifacts::Prompts(vec![s.clone()])
        }
        Value::Array(items) if items.is_empty() => Artifacts::Empty,
        Value::Array(items) => decode_list(items, depth),
        // A lone object is a one-element list.
        other => decode_list(std::slice::from_ref(other), depth),
    }
}

fn decode_list(items: &[Value], depth: usize) -> Artifacts {
    // Items may be JSON-encoded strings of objects. They are unwrapped only
    // when the whole payload arrived encoded, or when every item is then a
    // media object; otherwise a string item is a prompt, whatever it contains.
    let unwrapped: Vec<Value> = items.iter().map(|v| unwrap_item(v, depth)).collect();
    let items = if depth > 0 || unwrapped.iter().all(is_media_object) {
        unwrapped
    } else {
        items.to_vec()
    };

    if items.iter().all(|v| v.is_string()) {
        return Artifacts::Prompts(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        );
    }

    let media: Option<Vec<MediaArtifact>> = items
        .iter()
        .map(|v| match v {
            v if is_media_object(v) => serde_json::from_value::<MediaArtifact>(v.clone()).ok(),
            _ => None,
        })
        .collect();

    match media {
        Some(m) => Artifacts::Media(m),
        None => Artifacts::Json(items),
    }
}

fn unwrap_item(item: &Value, depth: usize) -> Value {
    match item {
        Value::String(s) if depth < MAX_DECODE_DEPTH => match serde_json::from_str::<Value>(s) {
            Ok(inner @ Value::Object(_)) => inner,
            _ => item.clone(),
        },
        _ => item.clone(),
    }
}

fn is_media_object(item: &Value) -> bool {
    matches!(item, Value::Object(map) if map.get("url").map_or(false, Value::is_string))
}

impl Serialize for Artifacts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_values().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Artifacts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Artifacts::decode(&raw))
    }
}
