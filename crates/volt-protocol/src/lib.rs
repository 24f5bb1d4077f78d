//! Wire envelopes exchanged over the broker.
//!
//! Everything crossing the broker boundary is JSON; these are the typed
//! projections used on both sides. Raw `serde_json::Value` only appears where
//! the payload genuinely is free-form (command arguments and results).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies the calling side of a command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CmdOrigin {
    pub module_id: String,
    pub impl_id: String,
}

/// Command request published to `<prefix>/modules/<target>/<impl>/cmd/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdRequest {
    pub id: String,
    pub origin: CmdOrigin,
    pub args: Value,
}

/// Error half of a command reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdFailure {
    pub kind: String,
    pub message: String,
}

/// Reply published on the per-call result topic.
///
/// The target first acknowledges receipt, then delivers either the result or
/// an error. Variants are distinguished by their payload key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CmdReply {
    Error { id: String, error: CmdFailure },
    Ack { id: String, ack: bool },
    Result { id: String, result: Value },
}

impl CmdReply {
    pub fn id(&self) -> &str {
        match self {
            CmdReply::Error { id, .. } | CmdReply::Ack { id, .. } | CmdReply::Result { id, .. } => {
                id
            }
        }
    }
}

/// Severity attached to a raised error instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

/// Where an error was raised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorOrigin {
    pub module_id: String,
    pub impl_id: String,
}

/// A raised (or cleared) error as it travels over the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInstance {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub sub_type: String,
    pub origin: ErrorOrigin,
    pub message: String,
    pub severity: ErrorSeverity,
    pub timestamp: DateTime<Utc>,
    pub uuid: Uuid,
}

impl ErrorInstance {
    pub fn new(
        error_type: impl Into<String>,
        sub_type: impl Into<String>,
        origin: ErrorOrigin,
        message: impl Into<String>,
        severity: ErrorSeverity,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            sub_type: sub_type.into(),
            origin,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Deduplication identity: two raises with the same identity refer to the
    /// same error episode.
    pub fn identity(&self) -> ErrorIdentity {
        ErrorIdentity {
            error_type: self.error_type.clone(),
            sub_type: self.sub_type.clone(),
            origin: self.origin.clone(),
        }
    }
}

/// `(type, sub_type, origin)` - the key of the active-errors database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorIdentity {
    pub error_type: String,
    pub sub_type: String,
    pub origin: ErrorOrigin,
}

/// Known error types, keyed `"<namespace>/<Name>"`, value is the description.
///
/// Built by the config resolver from the error-declaration files referenced
/// by interfaces and manifests; the error bus uses it to reject raises of
/// undeclared types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTypeMap(pub BTreeMap<String, String>);

impl ErrorTypeMap {
    pub fn contains(&self, error_type: &str) -> bool {
        self.0.contains_key(error_type)
    }

    pub fn insert(&mut self, error_type: impl Into<String>, description: impl Into<String>) {
        self.0.insert(error_type.into(), description.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
