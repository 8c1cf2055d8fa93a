//! Common types used throughout Keel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Name of a mirrored collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collection(String);

impl Collection {
    /// Create a new Collection name.
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains separators/whitespace
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid collection name: {name}"
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable record identifier, unique within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    /// Wrap an existing identifier.
    ///
    /// # Errors
    /// - Returns error if the id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh locally assigned identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schema-tagged attribute map carried by every record.
///
/// The shape of `fields` is defined externally per collection; the core only
/// moves it around. The `schema` tag is validated at the remote boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Schema version this payload conforms to.
    pub schema: u32,
    /// Attribute map.
    pub fields: Map<String, Value>,
}

impl Payload {
    /// Create a payload from a field map.
    pub fn new(schema: u32, fields: Map<String, Value>) -> Self {
        Self { schema, fields }
    }

    /// Create an empty payload for the given schema version.
    pub fn empty(schema: u32) -> Self {
        Self {
            schema,
            fields: Map::new(),
        }
    }

    /// Set a single field, returning self for chaining.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Get a field value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Merge the fields of `partial` into this payload (shallow, last wins).
    ///
    /// Keys absent from `partial` are left untouched, so a partial update
    /// never clears attributes it does not mention.
    pub fn merge(&mut self, partial: &Payload) {
        for (key, value) in &partial.fields {
            self.fields.insert(key.clone(), value.clone());
        }
        self.schema = self.schema.max(partial.schema);
    }

    /// Serialize to a JSON string for column storage.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON column value.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

/// Sync status of a mirrored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// In sync with the remote.
    Synced,
    /// Local changes queued for upload.
    Pending,
    /// An unresolved conflict references this record.
    Conflicted,
}

impl SyncStatus {
    /// Stable string form used for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflicted => "conflicted",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflicted" => Ok(SyncStatus::Conflicted),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown sync status: {other}"
            ))),
        }
    }
}

/// Kind of queued local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Stable string form used for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation: {other}"
            ))),
        }
    }
}

/// Shape of a detected divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Both sides updated the record.
    UpdateUpdate,
    /// Local updated, remote deleted.
    UpdateDelete,
    /// Local deleted, remote updated.
    DeleteUpdate,
}

impl ConflictKind {
    /// Stable string form used for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::UpdateUpdate => "update-update",
            ConflictKind::UpdateDelete => "update-delete",
            ConflictKind::DeleteUpdate => "delete-update",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "update-update" => Ok(ConflictKind::UpdateUpdate),
            "update-delete" => Ok(ConflictKind::UpdateDelete),
            "delete-update" => Ok(ConflictKind::DeleteUpdate),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown conflict kind: {other}"
            ))),
        }
    }
}

/// How a conflict was (or was not yet) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Unresolved,
    LocalWins,
    RemoteWins,
    ManualMerge,
}

impl Resolution {
    /// Stable string form used for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Unresolved => "unresolved",
            Resolution::LocalWins => "local-wins",
            Resolution::RemoteWins => "remote-wins",
            Resolution::ManualMerge => "manual-merge",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "unresolved" => Ok(Resolution::Unresolved),
            "local-wins" => Ok(Resolution::LocalWins),
            "remote-wins" => Ok(Resolution::RemoteWins),
            "manual-merge" => Ok(Resolution::ManualMerge),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown resolution: {other}"
            ))),
        }
    }
}
