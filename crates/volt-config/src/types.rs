//! Typed projections of the config and manifest documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn one() -> u32 {
    1
}

/// A single module entry of `active_modules`, after schema validation and
/// config-set defaulting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    /// The module type, i.e. the manifest this entry instantiates.
    pub module: String,
    #[serde(default)]
    pub config_module: BTreeMap<String, Value>,
    #[serde(default)]
    pub config_implementation: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub connections: BTreeMap<String, Vec<Connection>>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub standalone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evse: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mapping: BTreeMap<String, Mapping>,
}

/// A resolved binding from a requirement to a concrete provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub module_id: String,
    pub implementation_id: String,
}

/// One named dependency of a module, with its resolved connection list in
/// declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub interface: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connections: Vec<Connection>,
}

/// Manifest `provides` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidesSpec {
    pub interface: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

/// Manifest `requires` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub interface: String,
    #[serde(default = "one")]
    pub min_connections: u32,
    #[serde(default = "one")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub license: String,
    pub authors: Vec<String>,
}

/// Reference to an error declaration file (`/errors/<ns>`) or to a single
/// declaration within one (`/errors/<ns>/<Name>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReference {
    pub reference: String,
}

/// A concrete error type after reference inlining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTypeDecl {
    pub namespace: String,
    pub name: String,
    pub description: String,
}

impl ErrorTypeDecl {
    /// Full type string as used on the wire, `"<namespace>/<Name>"`.
    pub fn full_type(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Per-module manifest, schema-validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub description: String,
    pub provides: BTreeMap<String, ProvidesSpec>,
    #[serde(default)]
    pub requires: BTreeMap<String, RequirementSpec>,
    pub metadata: Metadata,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<ErrorReference>,
}

/// Physical placement of a module or implementation in the 3-tier model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub evse: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<u32>,
}

/// Tier mappings of one module. `None` means "mapped to the charging-station
/// root".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleTierMappings {
    pub module: Option<Mapping>,
    pub implementations: BTreeMap<String, Option<Mapping>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub id: u32,
}

/// Basic facts about a configured module instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: String,
    pub module_type: String,
    pub printable_name: String,
    pub authors: Vec<String>,
    pub license: String,
    pub capabilities: Vec<String>,
    pub standalone: bool,
}
