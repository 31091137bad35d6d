//! The unit of work moved through a workflow
//!
//! A [`Message`] owns its payload, string metadata, and an append-only
//! lifecycle trail recording every component it passed through. Metadata
//! keys support one level of indirection: a key written as `$$name` is
//! replaced by the *value* stored under `name` before the operation is
//! applied. The trail sequence number is derived from a metadata counter
//! so it survives encode/decode round trips through external systems.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Prefix marking a metadata key for one-level indirection
pub const METADATA_RESOLVE_PREFIX: &str = "$$";

/// Metadata key holding the lifecycle trail sequence counter
pub const SEQUENCE_NUMBER_KEY: &str = "flowbus-sequence-number";

/// Metadata key stamped with the owning workflow id
pub const WORKFLOW_ID_KEY: &str = "flowbus-workflow-id";

/// Metadata key stamped with the owning channel id
pub const CHANNEL_ID_KEY: &str = "flowbus-channel-id";

/// Metadata flag requesting that the workflow skip the produce step
pub const SKIP_PRODUCER_KEY: &str = "flowbus-skip-producer";

/// One entry in a message's lifecycle trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMarker {
    /// Name of the component the message passed through
    pub component_name: String,
    /// What the component did (e.g. "received", "service", "produce")
    pub qualifier: String,
    /// Position in the trail, derived from the metadata counter
    pub sequence: u32,
    /// Whether the component completed successfully
    pub success: bool,
    /// When the marker was appended
    pub timestamp: SystemTime,
}

/// A message flowing through the engine
///
/// Cloning yields a deep copy of payload, metadata, and trail; concurrent
/// pipelines never mutate shared state through a clone.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    payload: Vec<u8>,
    content_encoding: Option<String>,
    metadata: HashMap<String, String>,
    trail: Vec<MessageMarker>,
    next_service_id: String,
}

impl Message {
    /// Create a message with an explicit id; prefer [`MessageFactory`]
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            payload,
            content_encoding: None,
            metadata: HashMap::new(),
            trail: Vec::new(),
            next_service_id: String::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the id; used when a message identity must be preserved
    /// across a re-encode boundary
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn set_content_encoding(&mut self, encoding: impl Into<String>) {
        self.content_encoding = Some(encoding.into());
    }

    /// Resolve one level of `$$` key indirection
    ///
    /// `$$name` resolves to the value stored under `name`; if nothing is
    /// stored there the bare `name` is used instead.
    pub fn resolve_key(&self, key: &str) -> String {
        match key.strip_prefix(METADATA_RESOLVE_PREFIX) {
            Some(stripped) => self
                .metadata
                .get(stripped)
                .cloned()
                .unwrap_or_else(|| stripped.to_string()),
            None => key.to_string(),
        }
    }

    /// Look up a metadata value, applying key indirection
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        let resolved = self.resolve_key(key);
        self.metadata.get(&resolved).map(String::as_str)
    }

    /// Add or replace a metadata entry, applying key indirection
    pub fn add_metadata(&mut self, key: &str, value: impl Into<String>) {
        let resolved = self.resolve_key(key);
        self.metadata.insert(resolved, value.into());
    }

    pub fn contains_metadata(&self, key: &str) -> bool {
        let resolved = self.resolve_key(key);
        self.metadata.contains_key(&resolved)
    }

    pub fn remove_metadata(&mut self, key: &str) -> Option<String> {
        let resolved = self.resolve_key(key);
        self.metadata.remove(&resolved)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Whether the workflow should skip its produce step for this message
    pub fn skip_producer(&self) -> bool {
        self.metadata_value(SKIP_PRODUCER_KEY) == Some("true")
    }

    /// The branch target consulted by service collections
    pub fn next_service_id(&self) -> &str {
        &self.next_service_id
    }

    pub fn set_next_service_id(&mut self, id: impl Into<String>) {
        self.next_service_id = id.into();
    }

    pub fn clear_next_service_id(&mut self) {
        self.next_service_id.clear();
    }

    /// Append a lifecycle trail marker
    ///
    /// The sequence number lives in metadata (not in the trail itself) so
    /// it survives encode/decode round trips to external systems.
    pub fn add_marker(&mut self, component_name: &str, qualifier: &str, success: bool) {
        let sequence = self
            .metadata
            .get(SEQUENCE_NUMBER_KEY)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        self.metadata
            .insert(SEQUENCE_NUMBER_KEY.to_string(), sequence.to_string());
        self.trail.push(MessageMarker {
            component_name: component_name.to_string(),
            qualifier: qualifier.to_string(),
            sequence,
            success,
            timestamp: SystemTime::now(),
        });
    }

    pub fn trail(&self) -> &[MessageMarker] {
        &self.trail
    }
}

/// Pluggable id generation for [`MessageFactory`]
pub trait IdGenerator: Send + Sync + std::fmt::Debug {
    fn generate(&self) -> String;
}

/// Default id generator producing random v4 uuids
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// The only construction path for messages entering the engine
#[derive(Debug, Clone)]
pub struct MessageFactory {
    ids: Arc<dyn IdGenerator>,
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFactory {
    pub fn new() -> Self {
        Self {
            ids: Arc::new(UuidGenerator),
        }
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self { ids }
    }

    pub fn new_message(&self, payload: impl Into<Vec<u8>>) -> Message {
        Message::new(self.ids.generate(), payload.into())
    }

    pub fn new_message_with_metadata(
        &self,
        payload: impl Into<Vec<u8>>,
        metadata: HashMap<String, String>,
    ) -> Message {
        let mut message = self.new_message(payload);
        for (key, value) in metadata {
            message.add_metadata(&key, value);
        }
        message
    }
}
