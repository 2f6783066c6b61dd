//! Content fingerprints: the "did this product meaningfully change" test.

use std::fmt;

use catsync_core::Payload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Fields whose change counts as a real product update. Timestamps, images
/// and scrape metadata are not hashed.
pub const CONTENT_FIELDS: [&str; 11] = [
    "title",
    "description",
    "features",
    "main_color",
    "colors",
    "pressure_rating",
    "temperature_rating",
    "warranty",
    "wels_rating",
    "flow_rate",
    "status",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, stored: &str) -> bool {
        self.0 == stored
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Canonical JSON over the content fields present in `payload`, keys sorted
/// at every depth.
pub fn canonical_content(payload: &Payload) -> String {
    let mut selected = Map::new();
    let mut names = CONTENT_FIELDS;
    names.sort_unstable();
    for name in names {
        if let Some(value) = payload.get(name) {
            selected.insert(name.to_string(), canonicalize(value));
        }
    }
    JsonValue::Object(selected).to_string()
}

fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of the canonical content, hex encoded.
pub fn fingerprint(payload: &Payload) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(canonical_content(payload).as_bytes());
    ContentHash(hex::encode(hasher.finalize()))
}
