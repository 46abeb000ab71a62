//! Subtype extractors: completed bundles to named numeric channels.
//!
//! The pipeline never interprets payloads itself. An [`Extractor`] is created
//! by name from an [`ExtractorRegistry`] and fed each completed bundle; it
//! keeps whatever state its subtype needs between bundles. Missing fields are
//! reported as [`IngestEvent::Protocol`] warnings and never fail the bundle.

use crate::error::{IngestError, Result};
use crate::event::IngestEvent;
use crate::message::{bundle_to_string, RawMessage};
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashMap};
use toml::Value;

/// Value reported for a numeric field that was never received.
pub const MISSING_SENTINEL: f64 = -1.0;

/// One named output value.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Channel name
    pub name: String,
    /// Current value
    pub value: f64,
}

impl Channel {
    fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Result of extracting one bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Output channels, in a stable order
    pub channels: Vec<Channel>,
    /// Protocol warnings raised while reading the bundle
    pub warnings: Vec<IngestEvent>,
}

impl Extraction {
    /// Look up a channel value by name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value)
    }
}

/// Turns completed bundles of one subtype into channels.
pub trait Extractor: Send {
    /// Registry name of this extractor.
    fn subtype(&self) -> &str;

    /// Read one bundle, fragments in arrival order.
    fn extract(&mut self, bundle: &[RawMessage]) -> Extraction;
}

type ExtractorFactory = Box<dyn Fn(&Value) -> Result<Box<dyn Extractor>> + Send + Sync>;

/// Named extractor factories.
pub struct ExtractorRegistry {
    factories: HashMap<String, ExtractorFactory>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistry {
    /// Registry with the built-in extractors.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register(HeartbeatExtractor::SUBTYPE, |config| {
            let config: HeartbeatConfig = config.clone().try_into().map_err(|e| {
                IngestError::Configuration(format!("Invalid heartbeat extractor config: {e}"))
            })?;
            Ok(Box::new(HeartbeatExtractor::new(config)))
        });

        registry
    }

    /// Add or replace a factory.
    pub fn register<F>(&mut self, subtype: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Extractor>> + Send + Sync + 'static,
    {
        self.factories.insert(subtype.to_string(), Box::new(factory));
    }

    /// Instantiate the extractor registered under `subtype`.
    pub fn create(&self, subtype: &str, config: &Value) -> Result<Box<dyn Extractor>> {
        self.factories
            .get(subtype)
            .ok_or_else(|| IngestError::UnknownExtractor(subtype.to_string()))
            .and_then(|factory| factory(config))
    }

    /// Registered subtype names, sorted.
    pub fn subtypes(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Field names read from heartbeat frames.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// `header.frame_id` marking a heartbeat frame
    pub frame_id: String,
    /// Highest tracked ID
    pub max_id_field: String,
    /// Currently tracked IDs
    pub alive_ids_field: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            frame_id: "heartbeat".to_string(),
            max_id_field: "max_ID".to_string(),
            alive_ids_field: "aliveIDs".to_string(),
        }
    }
}

/// Counts heartbeat frames and tracks the announced ID set.
///
/// Fragments of other frame types pass through untouched. Channels:
/// `heartbeat` (frames seen), `maxId` (last announced, or -1) and
/// `aliveIds` (size of the last announced set).
#[derive(Debug)]
pub struct HeartbeatExtractor {
    config: HeartbeatConfig,
    heartbeats: u64,
    max_id: Option<i64>,
    alive_ids: BTreeSet<i64>,
}

impl HeartbeatExtractor {
    /// Registry name.
    pub const SUBTYPE: &'static str = "heartbeat";

    /// Create an extractor reading the given field names.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            heartbeats: 0,
            max_id: None,
            alive_ids: BTreeSet::new(),
        }
    }

    fn is_heartbeat(&self, fragment: &RawMessage) -> bool {
        fragment.stream_key().as_str() == self.config.frame_id
    }

    fn read(&mut self, doc: &Json, bundle: &[RawMessage], warnings: &mut Vec<IngestEvent>) {
        self.heartbeats += 1;

        match doc.get(&self.config.max_id_field).and_then(Json::as_i64) {
            Some(id) => self.max_id = Some(id),
            None => warnings.push(IngestEvent::Protocol(format!(
                "can't find {} field in heartbeat message",
                self.config.max_id_field
            ))),
        }

        match doc.get(&self.config.alive_ids_field).and_then(Json::as_array) {
            Some(ids) => {
                self.alive_ids = ids.iter().filter_map(Json::as_i64).collect();
                if self.alive_ids.len() != ids.len() {
                    warnings.push(IngestEvent::Protocol(format!(
                        "non-integer entries ignored in {}",
                        self.config.alive_ids_field
                    )));
                }
            }
            None => warnings.push(IngestEvent::Protocol(format!(
                "can't find {} field in heartbeat message: {}",
                self.config.alive_ids_field,
                bundle_to_string(bundle)
            ))),
        }
    }
}

impl Extractor for HeartbeatExtractor {
    fn subtype(&self) -> &str {
        Self::SUBTYPE
    }

    fn extract(&mut self, bundle: &[RawMessage]) -> Extraction {
        let mut warnings = Vec::new();
        for fragment in bundle {
            if self.is_heartbeat(fragment) {
                self.read(&fragment.document, bundle, &mut warnings);
            }
        }

        Extraction {
            channels: vec![
                Channel::new("heartbeat", self.heartbeats as f64),
                Channel::new("maxId", self.max_id.map_or(MISSING_SENTINEL, |id| id as f64)),
                Channel::new("aliveIds", self.alive_ids.len() as f64),
            ],
            warnings,
        }
    }
}
