//! Configuration resolver for the Voltgrid runtime.
//!
//! Takes the root config document, the module manifests, the interface and
//! type definitions and the error declarations, validates everything against
//! draft-7 schemas, resolves interface inheritance and cross-module
//! requirements, and freezes the result into a read-only [`ConfigModel`].
//!
//! ```no_run
//! use volt_config::Settings;
//!
//! let settings = Settings::load(None, None)?;
//! let model = volt_config::load(&settings)?;
//! for id in model.module_ids() {
//!     println!("{}", model.printable_identifier(&id).unwrap());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod interface;
mod loader;
mod model;
mod schema;
mod settings;
mod types;

pub use error::{BootError, ConfigError};
pub use interface::{CommandSpec, ResolvedInterface};
pub use loader::{load, load_all_manifests};
pub use model::{CmdPayloadValidator, ConfigModel};
pub use schema::{load_document, parse_type_ref, resolve_document, SchemaKind, SchemaSet, SchemaStore};
pub use settings::{MqttSettings, Settings, NAMESPACE};
pub use types::{
    Connection, ErrorReference, ErrorTypeDecl, Manifest, Mapping, Metadata, ModuleEntry,
    ModuleInfo, ModuleTierMappings, ProvidesSpec, Requirement, RequirementSpec, TelemetryConfig,
};
