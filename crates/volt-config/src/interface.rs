//! Interface loading, inheritance resolution and error-reference inlining.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::schema::{load_document, resolve_document, SchemaKind, SchemaStore};
use crate::types::{ErrorReference, ErrorTypeDecl};

/// One command of an interface: named, schema-typed arguments and an optional
/// result schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// An interface file as written on disk, before inheritance resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInterface {
    pub description: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub cmds: BTreeMap<String, CommandSpec>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<ErrorReference>,
}

/// An interface after walking the parent chain: commands and variables of the
/// whole chain composed, error references replaced by concrete declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedInterface {
    pub name: String,
    pub description: String,
    /// Ancestry, nearest parent first.
    pub parents: Vec<String>,
    pub cmds: BTreeMap<String, CommandSpec>,
    pub vars: BTreeMap<String, Value>,
    pub errors: Vec<ErrorTypeDecl>,
}

impl ResolvedInterface {
    /// Whether this interface equals `name` or descends from it.
    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.name == name || self.parents.iter().any(|p| p == name)
    }
}

/// Resolves interfaces on demand, memoizing results so shared ancestors are
/// loaded once.
pub(crate) struct InterfaceResolver<'a> {
    store: &'a SchemaStore,
    interfaces_dir: &'a Path,
    errors_dir: &'a Path,
    resolved: BTreeMap<String, Arc<ResolvedInterface>>,
}

impl<'a> InterfaceResolver<'a> {
    pub fn new(store: &'a SchemaStore, interfaces_dir: &'a Path, errors_dir: &'a Path) -> Self {
        Self {
            store,
            interfaces_dir,
            errors_dir,
            resolved: BTreeMap::new(),
        }
    }

    pub fn resolve(&mut self, name: &str) -> Result<Arc<ResolvedInterface>, ConfigError> {
        let mut stack = Vec::new();
        self.resolve_inner(name, &mut stack)
    }

    /// Everything resolved so far, including transitively loaded ancestors.
    pub fn into_resolved(self) -> BTreeMap<String, Arc<ResolvedInterface>> {
        self.resolved
    }

    fn resolve_inner(
        &mut self,
        name: &str,
        stack: &mut Vec<String>,
    ) -> Result<Arc<ResolvedInterface>, ConfigError> {
        if let Some(found) = self.resolved.get(name) {
            return Ok(found.clone());
        }
        if stack.iter().any(|n| n == name) {
            stack.push(name.to_string());
            return Err(ConfigError::whole(
                self.interfaces_dir,
                format!("interface inheritance cycle: {}", stack.join(" -> ")),
            ));
        }
        stack.push(name.to_string());

        let (file, raw) = self.load_raw(name)?;
        self.check_payload_schemas(&file, &raw)?;

        let mut resolved = ResolvedInterface {
            name: name.to_string(),
            description: raw.description.clone(),
            parents: Vec::new(),
            cmds: BTreeMap::new(),
            vars: BTreeMap::new(),
            errors: resolve_error_refs(&raw.errors, self.errors_dir, self.store, &file, "/errors")?,
        };

        if let Some(parent_name) = &raw.parent {
            let parent = self.resolve_inner(parent_name, stack)?;
            resolved.parents.push(parent.name.clone());
            resolved.parents.extend(parent.parents.iter().cloned());
            resolved.cmds = parent.cmds.clone();
            resolved.vars = parent.vars.clone();
            for decl in &parent.errors {
                if !resolved.errors.contains(decl) {
                    resolved.errors.push(decl.clone());
                }
            }
        }

        for (cmd_name, spec) in &raw.cmds {
            if resolved.cmds.contains_key(cmd_name) {
                let ancestor = self
                    .defining_ancestor_cmd(&resolved.parents, cmd_name)
                    .unwrap_or_else(|| resolved.parents.first().cloned().unwrap_or_default());
                return Err(ConfigError::new(
                    &file,
                    &format!("/cmds/{cmd_name}"),
                    format!(
                        "interface '{name}' redefines command '{cmd_name}' already defined by ancestor '{ancestor}'"
                    ),
                ));
            }
            resolved.cmds.insert(cmd_name.clone(), spec.clone());
        }

        for (var_name, schema) in &raw.vars {
            if resolved.vars.contains_key(var_name) {
                let ancestor = self
                    .defining_ancestor_var(&resolved.parents, var_name)
                    .unwrap_or_else(|| resolved.parents.first().cloned().unwrap_or_default());
                return Err(ConfigError::new(
                    &file,
                    &format!("/vars/{var_name}"),
                    format!(
                        "interface '{name}' redefines variable '{var_name}' already defined by ancestor '{ancestor}'"
                    ),
                ));
            }
            resolved.vars.insert(var_name.clone(), schema.clone());
        }

        stack.pop();
        let resolved = Arc::new(resolved);
        self.resolved.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    fn load_raw(&self, name: &str) -> Result<(PathBuf, RawInterface), ConfigError> {
        let file = resolve_document(self.interfaces_dir, name).ok_or_else(|| {
            ConfigError::whole(
                self.interfaces_dir,
                format!("interface '{name}' not found in {}", self.interfaces_dir.display()),
            )
        })?;
        let doc = load_document(&file)?;
        self.store.validate(SchemaKind::Interface, &doc, &file)?;
        let raw: RawInterface = serde_json::from_value(doc)
            .map_err(|e| ConfigError::whole(&file, format!("invalid interface: {e}")))?;
        Ok((file, raw))
    }

    /// Compiles every argument, result and variable schema so bad fragments
    /// and dangling type references surface at load time.
    fn check_payload_schemas(&self, file: &Path, raw: &RawInterface) -> Result<(), ConfigError> {
        for (cmd_name, spec) in &raw.cmds {
            for (arg_name, schema) in &spec.arguments {
                self.store
                    .compile_fragment(schema, file, &format!("/cmds/{cmd_name}/arguments/{arg_name}"))?;
            }
            if let Some(result) = &spec.result {
                self.store
                    .compile_fragment(result, file, &format!("/cmds/{cmd_name}/result"))?;
            }
        }
        for (var_name, schema) in &raw.vars {
            self.store
                .compile_fragment(schema, file, &format!("/vars/{var_name}"))?;
        }
        Ok(())
    }

    fn defining_ancestor_cmd(&self, parents: &[String], cmd: &str) -> Option<String> {
        parents
            .iter()
            .rev()
            .find(|p| {
                self.resolved
                    .get(p.as_str())
                    .is_some_and(|i| i.cmds.contains_key(cmd))
            })
            .cloned()
    }

    fn defining_ancestor_var(&self, parents: &[String], var: &str) -> Option<String> {
        parents
            .iter()
            .rev()
            .find(|p| {
                self.resolved
                    .get(p.as_str())
                    .is_some_and(|i| i.vars.contains_key(var))
            })
            .cloned()
    }
}

/// Replaces error references (`/errors/<ns>` for the whole list,
/// `/errors/<ns>/<Name>` for a single declaration) with the concrete
/// declarations from the error files.
pub(crate) fn resolve_error_refs(
    refs: &[ErrorReference],
    errors_dir: &Path,
    store: &SchemaStore,
    file: &Path,
    pointer: &str,
) -> Result<Vec<ErrorTypeDecl>, ConfigError> {
    #[derive(Deserialize)]
    struct ErrorListDoc {
        #[allow(dead_code)]
        description: String,
        errors: Vec<ErrorDeclDoc>,
    }
    #[derive(Deserialize)]
    struct ErrorDeclDoc {
        name: String,
        description: String,
    }

    let mut out: Vec<ErrorTypeDecl> = Vec::new();
    for entry in refs {
        let reference = &entry.reference;
        let parts: Vec<&str> = reference
            .strip_prefix("/errors/")
            .map(|rest| rest.split('/').collect())
            .unwrap_or_default();
        let (namespace, wanted) = match parts.as_slice() {
            [ns] => (*ns, None),
            [ns, name] => (*ns, Some(*name)),
            _ => {
                return Err(ConfigError::new(
                    file,
                    pointer,
                    format!("malformed error reference '{reference}'"),
                ))
            }
        };

        let list_file = resolve_document(errors_dir, namespace).ok_or_else(|| {
            ConfigError::new(
                file,
                pointer,
                format!(
                    "error declaration list '{namespace}' not found in {}",
                    errors_dir.display()
                ),
            )
        })?;
        let doc = load_document(&list_file)?;
        store.validate(SchemaKind::ErrorList, &doc, &list_file)?;
        let list: ErrorListDoc = serde_json::from_value(doc)
            .map_err(|e| ConfigError::whole(&list_file, format!("invalid error list: {e}")))?;

        let mut matched = false;
        for decl in list.errors {
            if wanted.is_some_and(|w| w != decl.name) {
                continue;
            }
            matched = true;
            let decl = ErrorTypeDecl {
                namespace: namespace.to_string(),
                name: decl.name,
                description: decl.description,
            };
            if !out.contains(&decl) {
                out.push(decl);
            }
        }
        if !matched {
            return Err(ConfigError::new(
                file,
                pointer,
                format!("error reference '{reference}' does not match any declaration"),
            ));
        }
    }
    Ok(out)
}
