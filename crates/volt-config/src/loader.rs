//! The resolver pipeline: documents in, frozen [`ConfigModel`] out.
//!
//! Loading is total: either every document validates, every interface
//! resolves and every requirement binds, or a [`ConfigError`] naming the
//! offending file and location is returned. No partial model escapes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use volt_protocol::ErrorTypeMap;

use crate::error::ConfigError;
use crate::interface::{resolve_error_refs, InterfaceResolver, ResolvedInterface};
use crate::model::ConfigModel;
use crate::schema::{load_document, resolve_document, SchemaKind, SchemaSet, SchemaStore};
use crate::settings::{json_type_name, Settings};
use crate::types::{ErrorTypeDecl, Manifest, Mapping, ModuleEntry, ModuleTierMappings, Requirement};

/// Loads, validates and resolves the whole configuration graph.
pub fn load(settings: &Settings) -> Result<ConfigModel, ConfigError> {
    let schema_set = match &settings.schemas_dir {
        Some(dir) => SchemaSet::load(dir)?,
        None => SchemaSet::builtin(),
    };
    let store = SchemaStore::new(schema_set, settings.types_dir.clone())?;

    let config_file = settings.config_file.as_path();
    let mut doc = load_document(config_file)?;
    if doc.is_null() {
        doc = json!({});
    }
    if !doc.is_object() {
        return Err(ConfigError::whole(
            config_file,
            format!(
                "config document has type {}, expected object",
                json_type_name(&doc)
            ),
        ));
    }

    if let Some(user_file) = &settings.user_config_file {
        apply_user_config(&mut doc, user_file)?;
    }

    store.validate(SchemaKind::Config, &doc, config_file)?;

    let active = match doc.get("active_modules") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        // unreachable after schema validation
        Some(other) => {
            return Err(ConfigError::new(
                config_file,
                "/active_modules",
                format!("has type {}, expected object", json_type_name(other)),
            ))
        }
    };

    let mut modules: BTreeMap<String, ModuleEntry> = BTreeMap::new();
    let mut manifests: BTreeMap<String, Manifest> = BTreeMap::new();
    let mut manifest_errors: BTreeMap<String, Vec<ErrorTypeDecl>> = BTreeMap::new();
    let mut resolver =
        InterfaceResolver::new(&store, &settings.interfaces_dir, &settings.errors_dir);

    for (module_id, entry_value) in &active {
        let pointer = format!("/active_modules/{module_id}");
        let mut entry: ModuleEntry =
            serde_json::from_value(entry_value.clone()).map_err(|e| {
                ConfigError::new(config_file, &pointer, format!("invalid module entry: {e}"))
            })?;

        if !manifests.contains_key(&entry.module) {
            let (manifest, decls) =
                load_manifest(settings, &store, &entry.module, config_file, &pointer)?;
            manifest_errors.insert(entry.module.clone(), decls);
            manifests.insert(entry.module.clone(), manifest);
        }
        let manifest = manifests
            .get(&entry.module)
            .cloned()
            .expect("manifest just inserted");

        entry.config_module = validate_config_set(
            &store,
            &manifest.config,
            &entry.config_module,
            config_file,
            &format!("{pointer}/config_module"),
        )?;

        for impl_id in entry.config_implementation.keys() {
            if !manifest.provides.contains_key(impl_id) {
                return Err(ConfigError::new(
                    config_file,
                    &format!("{pointer}/config_implementation/{impl_id}"),
                    format!(
                        "module type '{}' has no implementation '{impl_id}'",
                        entry.module
                    ),
                ));
            }
        }
        let mut impl_configs = BTreeMap::new();
        for (impl_id, provides) in &manifest.provides {
            let given = entry
                .config_implementation
                .get(impl_id)
                .cloned()
                .unwrap_or_default();
            let merged = validate_config_set(
                &store,
                &provides.config,
                &given,
                config_file,
                &format!("{pointer}/config_implementation/{impl_id}"),
            )?;
            if !merged.is_empty() {
                impl_configs.insert(impl_id.clone(), merged);
            }
        }
        entry.config_implementation = impl_configs;

        for provides in manifest.provides.values() {
            resolver.resolve(&provides.interface)?;
        }
        for spec in manifest.requires.values() {
            resolver.resolve(&spec.interface)?;
        }

        debug!(module_id = %module_id, module_type = %entry.module, "module entry validated");
        modules.insert(module_id.clone(), entry);
    }

    let interfaces = resolver.into_resolved();

    let requirements =
        resolve_requirements(&modules, &manifests, &interfaces, config_file)?;
    let tier_mappings = parse_tier_mappings(&modules, &manifests, config_file)?;

    let mut error_types = ErrorTypeMap::default();
    for interface in interfaces.values() {
        for decl in &interface.errors {
            error_types.insert(decl.full_type(), decl.description.clone());
        }
    }
    for decls in manifest_errors.values() {
        for decl in decls {
            error_types.insert(decl.full_type(), decl.description.clone());
        }
    }

    let types = store.loaded_types();

    Ok(ConfigModel::freeze(
        settings.clone(),
        modules,
        manifests,
        interfaces,
        types,
        error_types,
        requirements,
        tier_mappings,
        store,
    ))
}

/// Merges the `active_modules` of a user-config document over the main one.
/// User entries win key-by-key at the module-entry level.
fn apply_user_config(doc: &mut Value, user_file: &Path) -> Result<(), ConfigError> {
    let user_doc = load_document(user_file)?;
    let user_modules = match &user_doc {
        Value::Null => return Ok(()),
        Value::Object(map) => match map.get("active_modules") {
            None | Some(Value::Null) => return Ok(()),
            Some(Value::Object(modules)) => modules.clone(),
            Some(other) => {
                return Err(ConfigError::new(
                    user_file,
                    "/active_modules",
                    format!("has type {}, expected object", json_type_name(other)),
                ))
            }
        },
        other => {
            return Err(ConfigError::whole(
                user_file,
                format!(
                    "user-config document has type {}, expected object",
                    json_type_name(other)
                ),
            ))
        }
    };

    let root = doc.as_object_mut().expect("checked above");
    let active = root
        .entry("active_modules")
        .or_insert_with(|| json!({}));
    if active.is_null() {
        *active = json!({});
    }
    let active = active.as_object_mut().ok_or_else(|| {
        ConfigError::new(user_file, "/active_modules", "main config entry is not an object")
    })?;

    for (module_id, user_entry) in user_modules {
        let merged = match (active.get_mut(&module_id), &user_entry) {
            (Some(Value::Object(existing)), Value::Object(overlay)) => {
                for (key, value) in overlay {
                    existing.insert(key.clone(), value.clone());
                }
                true
            }
            _ => false,
        };
        if !merged {
            active.insert(module_id, user_entry);
        }
    }
    Ok(())
}

fn load_manifest(
    settings: &Settings,
    store: &SchemaStore,
    module_type: &str,
    config_file: &Path,
    pointer: &str,
) -> Result<(Manifest, Vec<ErrorTypeDecl>), ConfigError> {
    let module_dir = settings.modules_dir.join(module_type);
    let manifest_file = resolve_document(&module_dir, "manifest").ok_or_else(|| {
        ConfigError::new(
            config_file,
            pointer,
            format!(
                "module type '{module_type}' not found: no manifest in {}",
                module_dir.display()
            ),
        )
    })?;
    let doc = load_document(&manifest_file)?;
    store.validate(SchemaKind::Manifest, &doc, &manifest_file)?;
    let manifest: Manifest = serde_json::from_value(doc)
        .map_err(|e| ConfigError::whole(&manifest_file, format!("invalid manifest: {e}")))?;

    for (req_id, spec) in &manifest.requires {
        if spec.min_connections > spec.max_connections {
            return Err(ConfigError::new(
                &manifest_file,
                &format!("/requires/{req_id}"),
                format!(
                    "min_connections {} exceeds max_connections {}",
                    spec.min_connections, spec.max_connections
                ),
            ));
        }
    }

    let decls = resolve_error_refs(
        &manifest.errors,
        &settings.errors_dir,
        store,
        &manifest_file,
        "/errors",
    )?;
    Ok((manifest, decls))
}

/// Checks a given config map against its declared config set, applying
/// defaults and rejecting unknown, missing and mistyped entries.
fn validate_config_set(
    store: &SchemaStore,
    declared: &BTreeMap<String, Value>,
    given: &BTreeMap<String, Value>,
    file: &Path,
    pointer: &str,
) -> Result<BTreeMap<String, Value>, ConfigError> {
    for key in given.keys() {
        if !declared.contains_key(key) {
            return Err(ConfigError::new(
                file,
                &format!("{pointer}/{key}"),
                format!("unknown config entry '{key}'"),
            ));
        }
    }

    let mut merged = BTreeMap::new();
    for (key, decl) in declared {
        let entry_pointer = format!("{pointer}/{key}");
        match given.get(key) {
            Some(value) => {
                let validator = store.compile_fragment(decl, file, &entry_pointer)?;
                let reasons: Vec<String> =
                    validator.iter_errors(value).map(|e| e.to_string()).collect();
                if !reasons.is_empty() {
                    return Err(ConfigError::new(
                        file,
                        &entry_pointer,
                        format!("config entry '{key}' is invalid: {}", reasons.join("; ")),
                    ));
                }
                merged.insert(key.clone(), value.clone());
            }
            None => match decl.get("default") {
                Some(default) => {
                    merged.insert(key.clone(), default.clone());
                }
                None => {
                    return Err(ConfigError::new(
                        file,
                        &entry_pointer,
                        format!("missing required config entry '{key}'"),
                    ))
                }
            },
        }
    }
    Ok(merged)
}

/// Binds every declared requirement to its connection list, enforcing
/// interface compatibility and connection-count bounds.
fn resolve_requirements(
    modules: &BTreeMap<String, ModuleEntry>,
    manifests: &BTreeMap<String, Manifest>,
    interfaces: &BTreeMap<String, Arc<ResolvedInterface>>,
    config_file: &Path,
) -> Result<BTreeMap<String, Vec<Requirement>>, ConfigError> {
    let mut out = BTreeMap::new();
    for (module_id, entry) in modules {
        let manifest = &manifests[&entry.module];

        for req_id in entry.connections.keys() {
            if !manifest.requires.contains_key(req_id) {
                return Err(ConfigError::new(
                    config_file,
                    &format!("/active_modules/{module_id}/connections/{req_id}"),
                    format!(
                        "module type '{}' declares no requirement '{req_id}'",
                        entry.module
                    ),
                ));
            }
        }

        let mut requirements = Vec::new();
        for (req_id, spec) in &manifest.requires {
            let pointer = format!("/active_modules/{module_id}/connections/{req_id}");
            let connections = entry.connections.get(req_id).cloned().unwrap_or_default();

            let count = connections.len() as u32;
            if count < spec.min_connections {
                return Err(ConfigError::new(
                    config_file,
                    &pointer,
                    format!(
                        "requirement '{req_id}' of module '{module_id}' needs at least {} connection(s) to interface '{}', found {count}",
                        spec.min_connections, spec.interface
                    ),
                ));
            }
            if count > spec.max_connections {
                return Err(ConfigError::new(
                    config_file,
                    &pointer,
                    format!(
                        "requirement '{req_id}' of module '{module_id}' allows at most {} connection(s), found {count}",
                        spec.max_connections
                    ),
                ));
            }

            for (index, connection) in connections.iter().enumerate() {
                let conn_pointer = format!("{pointer}/{index}");
                let target = modules.get(&connection.module_id).ok_or_else(|| {
                    ConfigError::new(
                        config_file,
                        &conn_pointer,
                        format!("connection target module '{}' does not exist", connection.module_id),
                    )
                })?;
                let target_manifest = &manifests[&target.module];
                let provides = target_manifest
                    .provides
                    .get(&connection.implementation_id)
                    .ok_or_else(|| {
                        ConfigError::new(
                            config_file,
                            &conn_pointer,
                            format!(
                                "module '{}' (type '{}') has no implementation '{}'",
                                connection.module_id, target.module, connection.implementation_id
                            ),
                        )
                    })?;
                let interface = interfaces
                    .get(&provides.interface)
                    .expect("provider interfaces resolved during module pass");
                if !interface.is_subtype_of(&spec.interface) {
                    return Err(ConfigError::new(
                        config_file,
                        &conn_pointer,
                        format!(
                            "implementation '{}' of module '{}' provides interface '{}', which does not satisfy required interface '{}'",
                            connection.implementation_id,
                            connection.module_id,
                            provides.interface,
                            spec.interface
                        ),
                    ));
                }
            }

            requirements.push(Requirement {
                id: req_id.clone(),
                interface: spec.interface.clone(),
                min_connections: spec.min_connections,
                max_connections: spec.max_connections,
                connections,
            });
        }
        out.insert(module_id.clone(), requirements);
    }
    Ok(out)
}

/// Parses the 3-tier mappings: module-wide `evse`/`connector` keys plus
/// per-implementation overrides under `mapping`. Implementations inherit the
/// module mapping unless overridden; no mapping at all means the module sits
/// at the charging-station root.
fn parse_tier_mappings(
    modules: &BTreeMap<String, ModuleEntry>,
    manifests: &BTreeMap<String, Manifest>,
    config_file: &Path,
) -> Result<BTreeMap<String, ModuleTierMappings>, ConfigError> {
    let mut out = BTreeMap::new();
    for (module_id, entry) in modules {
        let manifest = &manifests[&entry.module];

        if entry.connector.is_some() && entry.evse.is_none() {
            return Err(ConfigError::new(
                config_file,
                &format!("/active_modules/{module_id}/connector"),
                "module-level 'connector' mapping requires an 'evse' mapping",
            ));
        }
        for impl_id in entry.mapping.keys() {
            if !manifest.provides.contains_key(impl_id) {
                return Err(ConfigError::new(
                    config_file,
                    &format!("/active_modules/{module_id}/mapping/{impl_id}"),
                    format!(
                        "module type '{}' has no implementation '{impl_id}'",
                        entry.module
                    ),
                ));
            }
        }

        let module_mapping = entry.evse.map(|evse| Mapping {
            evse,
            connector: entry.connector,
        });
        let mut tier = ModuleTierMappings {
            module: module_mapping,
            implementations: BTreeMap::new(),
        };
        for impl_id in manifest.provides.keys() {
            let mapping = entry.mapping.get(impl_id).copied().or(module_mapping);
            tier.implementations.insert(impl_id.clone(), mapping);
        }
        out.insert(module_id.clone(), tier);
    }
    Ok(out)
}

/// Loads and validates every manifest below the modules directory, regardless
/// of whether the config references it. Used by `--dumpmanifests`.
pub fn load_all_manifests(settings: &Settings) -> Result<BTreeMap<String, Value>, ConfigError> {
    let schema_set = match &settings.schemas_dir {
        Some(dir) => SchemaSet::load(dir)?,
        None => SchemaSet::builtin(),
    };
    let store = SchemaStore::new(schema_set, settings.types_dir.clone())?;

    let mut out = BTreeMap::new();
    let entries = match std::fs::read_dir(&settings.modules_dir) {
        Ok(entries) => entries,
        Err(e) => {
            return Err(ConfigError::whole(
                &settings.modules_dir,
                format!("cannot list modules directory: {e}"),
            ))
        }
    };
    for dir_entry in entries.flatten() {
        let path = dir_entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(manifest_file) = resolve_document(&path, "manifest") else {
            continue;
        };
        let doc = load_document(&manifest_file)?;
        store.validate(SchemaKind::Manifest, &doc, &manifest_file)?;
        let module_type = dir_entry.file_name().to_string_lossy().to_string();
        out.insert(module_type, doc);
    }
    Ok(out)
}
