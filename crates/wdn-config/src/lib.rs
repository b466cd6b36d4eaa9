//! Layered YAML configuration.
//!
//! The agent's effective configuration is the base file overlaid with the
//! group files shared by the manager, in order. Overlay rules: maps merge
//! key by key; sequences merge element-wise, where an element is identified
//! by its scalar value or by the first key of a single-entry map (base
//! order wins, unmatched overlay elements append); any other pairing
//! overwrites. The merged document gets a key-order-insensitive content
//! hash so config drift is observable across restarts.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::map::Entry;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Reads and overlays YAML files in order, then hashes the result.
pub fn load_config_layers<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for path in paths {
        let layer = read_yaml_document(path.as_ref())?;
        merge_values(&mut merged, layer);
    }
    let config_hash = hash_config(&merged);
    Ok(LoadedConfig {
        config_json: merged,
        config_hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub config_hash: String,
}

fn read_yaml_document(path: &Path) -> Result<Value> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read config: {}", path.display()))?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parse yaml: {}", path.display()))?;
    serde_json::to_value(doc).with_context(|| format!("convert yaml: {}", path.display()))
}

/// Overlays `overlay` onto `base`.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut slot) => merge_values(slot.get_mut(), overlay_value),
                    Entry::Vacant(slot) => {
                        slot.insert(overlay_value);
                    }
                }
            }
        }
        (Value::Array(base_seq), Value::Array(overlay_seq)) => {
            *base_seq = merge_sequences(std::mem::take(base_seq), overlay_seq);
        }
        (slot, overlay_value) => *slot = overlay_value,
    }
}

/// Identity of a sequence element: its scalar value, or the first key of a
/// map element (module lists are sequences of single-key maps). Elements
/// with no identity cannot be overridden.
fn sequence_key(element: &Value) -> Option<String> {
    match element {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.keys().next().cloned(),
        _ => None,
    }
}

/// Element-wise sequence merge: base order is preserved, an overlay element
/// replaces the base element sharing its identity, and overlay elements
/// with no base counterpart are appended in their own order. Overlay
/// elements without an identity are dropped.
fn merge_sequences(base: Vec<Value>, overlay: Vec<Value>) -> Vec<Value> {
    let overlay_items: Vec<(String, Value)> = overlay
        .into_iter()
        .filter_map(|elem| sequence_key(&elem).map(|key| (key, elem)))
        .collect();

    let mut replaced: HashSet<String> = HashSet::new();
    let mut merged = Vec::with_capacity(base.len() + overlay_items.len());

    for elem in base {
        let Some(key) = sequence_key(&elem) else {
            merged.push(elem);
            continue;
        };
        match overlay_items.iter().find(|(k, _)| *k == key) {
            Some((k, replacement)) => {
                merged.push(replacement.clone());
                replaced.insert(k.clone());
            }
            None => merged.push(elem),
        }
    }

    for (key, elem) in overlay_items {
        if !replaced.contains(&key) {
            merged.push(elem);
        }
    }
    merged
}

/// Content hash of the merged document. Every node is fed to the hasher
/// with a type tag and a length prefix, and object keys are visited in
/// sorted order, so the hash ignores YAML key order but catches any value
/// change.
fn hash_config(config: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_node(&mut hasher, config);
    hex::encode(hasher.finalize())
}

fn hash_node(hasher: &mut Sha256, node: &Value) {
    match node {
        Value::Null => hasher.update(b"~"),
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([u8::from(*b)]);
        }
        Value::Number(n) => {
            hasher.update(b"n");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                hash_node(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update(b"{");
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                hash_node(hasher, &map[key]);
            }
        }
    }
}

/// Typed access over the merged document. Every getter falls back to its
/// default on a missing key or an unparseable value, so a broken group file
/// degrades the agent instead of stopping it.
pub struct ConfigParser {
    loaded: LoadedConfig,
}

impl ConfigParser {
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        Ok(Self {
            loaded: load_config_layers(paths)?,
        })
    }

    pub fn from_value(config_json: Value) -> Self {
        let config_hash = hash_config(&config_json);
        Self {
            loaded: LoadedConfig {
                config_json,
                config_hash,
            },
        }
    }

    pub fn config_hash(&self) -> &str {
        &self.loaded.config_hash
    }

    pub fn config_json(&self) -> &Value {
        &self.loaded.config_json
    }

    fn lookup(&self, keys: &[&str]) -> Option<&Value> {
        let mut current = &self.loaded.config_json;
        for key in keys {
            current = current.get(key)?;
        }
        Some(current)
    }

    pub fn get_string_or(&self, default: &str, keys: &[&str]) -> String {
        self.lookup(keys)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool_or(&self, default: bool, keys: &[&str]) -> bool {
        self.lookup(keys).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_strings_or(&self, default: &[&str], keys: &[&str]) -> Vec<String> {
        self.lookup(keys)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
    }

    /// Duration option. Bare numbers are milliseconds; strings take a unit
    /// suffix (`ms`, `s`, `m`, `h`, `d`).
    pub fn get_time_or(&self, default: Duration, keys: &[&str]) -> Duration {
        match self.lookup(keys) {
            None => default,
            Some(value) => parse_time(value).unwrap_or_else(|| {
                tracing::warn!(option = keys.join("."), "invalid duration value, using default");
                default
            }),
        }
    }

    pub fn get_time_in_range_or(
        &self,
        default: Duration,
        min: Duration,
        max: Duration,
        keys: &[&str],
    ) -> Duration {
        clamp(self.get_time_or(default, keys), min, max, keys)
    }

    /// Byte-size option. Bare numbers are bytes; strings take a unit suffix
    /// (`B`, `KB`, `MB`, `GB`, binary multiples).
    pub fn get_bytes_or(&self, default: u64, keys: &[&str]) -> u64 {
        match self.lookup(keys) {
            None => default,
            Some(value) => parse_bytes(value).unwrap_or_else(|| {
                tracing::warn!(option = keys.join("."), "invalid size value, using default");
                default
            }),
        }
    }

    pub fn get_bytes_in_range_or(&self, default: u64, min: u64, max: u64, keys: &[&str]) -> u64 {
        clamp(self.get_bytes_or(default, keys), min, max, keys)
    }
}

fn clamp<T: PartialOrd + Copy + std::fmt::Debug>(value: T, min: T, max: T, keys: &[&str]) -> T {
    if value < min {
        tracing::warn!(option = keys.join("."), ?value, ?min, "value below minimum, clamping");
        min
    } else if value > max {
        tracing::warn!(option = keys.join("."), ?value, ?max, "value above maximum, clamping");
        max
    } else {
        value
    }
}

fn parse_time(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_millis),
        Value::String(s) => parse_time_str(s),
        _ => None,
    }
}

fn parse_time_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Some(Duration::from_millis(n));
    }
    let unit_start = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(unit_start);
    let n: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(n.checked_mul(3600)?)),
        "d" => Some(Duration::from_secs(n.checked_mul(86_400)?)),
        _ => None,
    }
}

fn parse_bytes(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_bytes_str(s),
        _ => None,
    }
}

fn parse_bytes_str(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let unit_start = s.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = s.split_at(unit_start);
    let n: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.trim() {
        "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        _ => return None,
    };
    n.checked_mul(multiplier)
}
