//! The frozen, queryable configuration model.

use std::collections::BTreeMap;
use std::sync::Arc;

use jsonschema::Validator;
use serde_json::{json, Value};
use volt_protocol::ErrorTypeMap;

use crate::error::ConfigError;
use crate::interface::ResolvedInterface;
use crate::schema::SchemaStore;
use crate::settings::Settings;
use crate::types::{
    Connection, Manifest, Mapping, ModuleEntry, ModuleInfo, ModuleTierMappings, Requirement,
    TelemetryConfig,
};

/// Result of a successful [`crate::load`]. Read-only for the rest of the
/// process lifetime; queries never mutate and need no synchronization.
#[derive(Debug)]
pub struct ConfigModel {
    settings: Settings,
    modules: BTreeMap<String, ModuleEntry>,
    manifests: BTreeMap<String, Manifest>,
    interfaces: BTreeMap<String, Arc<ResolvedInterface>>,
    types: BTreeMap<String, Value>,
    error_types: ErrorTypeMap,
    requirements: BTreeMap<String, Vec<Requirement>>,
    tier_mappings: BTreeMap<String, ModuleTierMappings>,
    store: SchemaStore,
}

impl ConfigModel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn freeze(
        settings: Settings,
        modules: BTreeMap<String, ModuleEntry>,
        manifests: BTreeMap<String, Manifest>,
        interfaces: BTreeMap<String, Arc<ResolvedInterface>>,
        types: BTreeMap<String, Value>,
        error_types: ErrorTypeMap,
        requirements: BTreeMap<String, Vec<Requirement>>,
        tier_mappings: BTreeMap<String, ModuleTierMappings>,
        store: SchemaStore,
    ) -> Self {
        Self {
            settings,
            modules,
            manifests,
            interfaces,
            types,
            error_types,
            requirements,
            tier_mappings,
            store,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Configured module ids, sorted.
    pub fn module_ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    pub fn module(&self, module_id: &str) -> Option<&ModuleEntry> {
        self.modules.get(module_id)
    }

    /// The manifest name this module instantiates.
    pub fn module_name(&self, module_id: &str) -> Option<&str> {
        self.modules.get(module_id).map(|m| m.module.as_str())
    }

    pub fn manifest_of(&self, module_id: &str) -> Option<&Manifest> {
        let entry = self.modules.get(module_id)?;
        self.manifests.get(&entry.module)
    }

    pub fn module_info(&self, module_id: &str) -> Option<ModuleInfo> {
        let entry = self.modules.get(module_id)?;
        let manifest = self.manifests.get(&entry.module)?;
        Some(ModuleInfo {
            id: module_id.to_string(),
            module_type: entry.module.clone(),
            printable_name: self.printable_identifier(module_id)?,
            authors: manifest.metadata.authors.clone(),
            license: manifest.metadata.license.clone(),
            capabilities: entry.capabilities.clone(),
            standalone: entry.standalone,
        })
    }

    /// `<module_id>:<module_type>`
    pub fn printable_identifier(&self, module_id: &str) -> Option<String> {
        let entry = self.modules.get(module_id)?;
        Some(format!("{module_id}:{}", entry.module))
    }

    /// `<module_id>:<module_type>->(impl_id):<interface>`
    pub fn printable_identifier_impl(&self, module_id: &str, impl_id: &str) -> Option<String> {
        let entry = self.modules.get(module_id)?;
        let manifest = self.manifests.get(&entry.module)?;
        let provides = manifest.provides.get(impl_id)?;
        Some(format!(
            "{module_id}:{}->{impl_id}:{}",
            entry.module, provides.interface
        ))
    }

    pub fn module_provides(&self, module_id: &str, impl_id: &str) -> bool {
        self.manifest_of(module_id)
            .is_some_and(|m| m.provides.contains_key(impl_id))
    }

    /// The resolved interface of one implementation of a module.
    pub fn interface_of(&self, module_id: &str, impl_id: &str) -> Option<&ResolvedInterface> {
        let manifest = self.manifest_of(module_id)?;
        let provides = manifest.provides.get(impl_id)?;
        self.interfaces.get(&provides.interface).map(|i| i.as_ref())
    }

    pub fn interface_definition(&self, name: &str) -> Option<&ResolvedInterface> {
        self.interfaces.get(name).map(|i| i.as_ref())
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.keys().cloned().collect()
    }

    /// All requirements of a module with their resolved connections, in
    /// requirement-id order. Empty for unknown modules.
    pub fn requirements(&self, module_id: &str) -> &[Requirement] {
        self.requirements
            .get(module_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The ordered connection list of one requirement.
    pub fn resolve(&self, module_id: &str, requirement_id: &str) -> Option<&[Connection]> {
        self.requirements
            .get(module_id)?
            .iter()
            .find(|r| r.id == requirement_id)
            .map(|r| r.connections.as_slice())
    }

    pub fn error_types(&self) -> &ErrorTypeMap {
        &self.error_types
    }

    pub fn types(&self) -> &BTreeMap<String, Value> {
        &self.types
    }

    pub fn tier_mapping(&self, module_id: &str) -> Option<&ModuleTierMappings> {
        self.tier_mappings.get(module_id)
    }

    /// The effective mapping of one implementation; `None` means the
    /// charging-station root.
    pub fn tier_mapping_impl(&self, module_id: &str, impl_id: &str) -> Option<Mapping> {
        self.tier_mappings
            .get(module_id)?
            .implementations
            .get(impl_id)
            .copied()
            .flatten()
    }

    pub fn telemetry_config(&self, module_id: &str) -> Option<TelemetryConfig> {
        self.modules.get(module_id)?.telemetry
    }

    pub fn module_config(&self, module_id: &str) -> Option<&BTreeMap<String, Value>> {
        self.modules.get(module_id).map(|m| &m.config_module)
    }

    pub fn implementation_config(
        &self,
        module_id: &str,
        impl_id: &str,
    ) -> Option<&BTreeMap<String, Value>> {
        self.modules.get(module_id)?.config_implementation.get(impl_id)
    }

    /// Builds the per-command payload validators of one implementation, for
    /// RPC argument/result validation.
    pub fn cmd_validator(
        &self,
        module_id: &str,
        impl_id: &str,
    ) -> Result<CmdPayloadValidator, ConfigError> {
        let interface = self.interface_of(module_id, impl_id).ok_or_else(|| ConfigError {
            file: self.settings.config_file.display().to_string(),
            pointer: String::new(),
            reason: format!("no implementation '{impl_id}' on module '{module_id}'"),
        })?;
        let file = self.settings.config_file.clone();
        let mut cmds = BTreeMap::new();
        for (cmd_name, spec) in &interface.cmds {
            let mut args = BTreeMap::new();
            for (arg_name, schema) in &spec.arguments {
                let validator = self.store.compile_fragment(
                    schema,
                    &file,
                    &format!("/cmds/{cmd_name}/arguments/{arg_name}"),
                )?;
                args.insert(arg_name.clone(), validator);
            }
            let result = spec
                .result
                .as_ref()
                .map(|schema| {
                    self.store
                        .compile_fragment(schema, &file, &format!("/cmds/{cmd_name}/result"))
                })
                .transpose()?;
            cmds.insert(cmd_name.clone(), CmdValidators { args, result });
        }
        Ok(CmdPayloadValidator { cmds })
    }

    /// One JSON document containing the whole frozen model, for dumping and
    /// for handing to module processes.
    pub fn serialize(&self) -> Value {
        let module_names: BTreeMap<&String, &String> = self
            .modules
            .iter()
            .map(|(id, entry)| (id, &entry.module))
            .collect();
        let interfaces: BTreeMap<&String, &ResolvedInterface> = self
            .interfaces
            .iter()
            .map(|(name, iface)| (name, iface.as_ref()))
            .collect();
        let telemetry: BTreeMap<&String, TelemetryConfig> = self
            .modules
            .iter()
            .filter_map(|(id, entry)| entry.telemetry.map(|t| (id, t)))
            .collect();
        json!({
            "modules": &self.modules,
            "module_names": module_names,
            "manifests": &self.manifests,
            "interfaces": interfaces,
            "types": &self.types,
            "error_types": &self.error_types,
            "requirements": &self.requirements,
            "mappings": &self.tier_mappings,
            "telemetry": telemetry,
        })
    }
}

struct CmdValidators {
    args: BTreeMap<String, Validator>,
    result: Option<Validator>,
}

/// Validates command arguments and results against the interface schemas.
pub struct CmdPayloadValidator {
    cmds: BTreeMap<String, CmdValidators>,
}

impl CmdPayloadValidator {
    pub fn validate_args(&self, cmd: &str, args: &Value) -> Result<(), String> {
        let spec = self
            .cmds
            .get(cmd)
            .ok_or_else(|| format!("unknown command '{cmd}'"))?;
        let object = args
            .as_object()
            .ok_or_else(|| "arguments must be an object".to_string())?;
        for key in object.keys() {
            if !spec.args.contains_key(key) {
                return Err(format!("unknown argument '{key}' for command '{cmd}'"));
            }
        }
        for (name, validator) in &spec.args {
            let value = object
                .get(name)
                .ok_or_else(|| format!("missing argument '{name}' for command '{cmd}'"))?;
            let reasons: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
            if !reasons.is_empty() {
                return Err(format!("argument '{name}' is invalid: {}", reasons.join("; ")));
            }
        }
        Ok(())
    }

    pub fn validate_result(&self, cmd: &str, result: &Value) -> Result<(), String> {
        let spec = self
            .cmds
            .get(cmd)
            .ok_or_else(|| format!("unknown command '{cmd}'"))?;
        match &spec.result {
            Some(validator) => {
                let reasons: Vec<String> =
                    validator.iter_errors(result).map(|e| e.to_string()).collect();
                if reasons.is_empty() {
                    Ok(())
                } else {
                    Err(format!("result is invalid: {}", reasons.join("; ")))
                }
            }
            None => Ok(()),
        }
    }
}
