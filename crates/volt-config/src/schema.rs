//! Schema documents and draft-7 validation plumbing.
//!
//! The five document schemas (config, manifest, interface, type,
//! error-declaration-list) ship embedded in the crate and can be overridden
//! file-by-file from a schemas directory. Command/variable payload schemas and
//! manifest config entries may reference shared type definitions with the
//! restricted form `/<file>#/<TypeName>`; those references are rewritten to
//! `type://` URIs and served by a custom retriever that refuses anything else.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use jsonschema::{Draft, Retrieve, Uri, Validator};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::ConfigError;

/// Which of the five document schemas to validate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaKind {
    Config,
    Manifest,
    Interface,
    Type,
    ErrorList,
}

impl SchemaKind {
    fn stem(self) -> &'static str {
        match self {
            SchemaKind::Config => "config",
            SchemaKind::Manifest => "manifest",
            SchemaKind::Interface => "interface",
            SchemaKind::Type => "type",
            SchemaKind::ErrorList => "error_declaration_list",
        }
    }
}

/// The five schema documents as raw JSON.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    pub config: Value,
    pub manifest: Value,
    pub interface: Value,
    pub type_def: Value,
    pub error_list: Value,
}

static BUILTIN: Lazy<SchemaSet> = Lazy::new(|| {
    let parse = |raw: &str| serde_json::from_str(raw).expect("embedded schema must parse");
    SchemaSet {
        config: parse(include_str!("../schemas/config.json")),
        manifest: parse(include_str!("../schemas/manifest.json")),
        interface: parse(include_str!("../schemas/interface.json")),
        type_def: parse(include_str!("../schemas/type.json")),
        error_list: parse(include_str!("../schemas/error_declaration_list.json")),
    }
});

impl SchemaSet {
    pub fn builtin() -> SchemaSet {
        BUILTIN.clone()
    }

    /// Loads the schema set from a directory, falling back to the embedded
    /// document for any file that is absent.
    pub fn load(dir: &Path) -> Result<SchemaSet, ConfigError> {
        let mut set = SchemaSet::builtin();
        for (kind, slot) in [
            (SchemaKind::Config, &mut set.config),
            (SchemaKind::Manifest, &mut set.manifest),
            (SchemaKind::Interface, &mut set.interface),
            (SchemaKind::Type, &mut set.type_def),
            (SchemaKind::ErrorList, &mut set.error_list),
        ] {
            if let Some(path) = resolve_document(dir, kind.stem()) {
                *slot = load_document(&path)?;
            }
        }
        Ok(set)
    }

    fn get(&self, kind: SchemaKind) -> &Value {
        match kind {
            SchemaKind::Config => &self.config,
            SchemaKind::Manifest => &self.manifest,
            SchemaKind::Interface => &self.interface,
            SchemaKind::Type => &self.type_def,
            SchemaKind::ErrorList => &self.error_list,
        }
    }
}

/// Reads and parses a YAML or JSON document into a JSON value. An empty file
/// parses as `null`.
pub fn load_document(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::whole(path, format!("cannot read file: {e}")))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_yaml::from_str(&text).map_err(|e| ConfigError::whole(path, format!("parse error: {e}")))
}

/// Looks for `<dir>/<stem>.yaml` or `<dir>/<stem>.json`.
pub fn resolve_document(dir: &Path, stem: &str) -> Option<PathBuf> {
    for ext in ["yaml", "json"] {
        let candidate = dir.join(format!("{stem}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn is_ref_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Splits a restricted type reference `/<file>#/<TypeName>` into its file path
/// (without leading slash) and type name. Returns `None` for any other shape.
pub fn parse_type_ref(reference: &str) -> Option<(String, String)> {
    let (path, fragment) = reference.split_once("#/")?;
    let path = path.strip_prefix('/')?;
    if path.is_empty() || !path.split('/').all(is_ref_segment) || !is_ref_segment(fragment) {
        return None;
    }
    Some((path.to_string(), fragment.to_string()))
}

/// Rewrites every restricted type reference in `value` to an absolute
/// `type://` URI, recording the referenced file paths in `found`.
pub(crate) fn rewrite_type_refs(value: &mut Value, found: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("$ref") {
                if let Some((path, fragment)) = parse_type_ref(reference) {
                    found.insert(path.clone());
                    map.insert(
                        "$ref".into(),
                        Value::String(format!("type:///{path}#/{fragment}")),
                    );
                }
            }
            for entry in map.values_mut() {
                rewrite_type_refs(entry, found);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_type_refs(item, found);
            }
        }
        _ => {}
    }
}

fn resolve_type_file(types_dir: &Path, path: &str) -> Option<PathBuf> {
    for ext in ["yaml", "json"] {
        let candidate = types_dir.join(format!("{path}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Serves `type://` references from the types directory and refuses every
/// other remote reference. Draft-7 itself is built into the validator; a
/// literal reference to it is accepted as the always-true schema.
struct TypeRetriever {
    types_dir: PathBuf,
}

impl Retrieve for TypeRetriever {
    fn retrieve(
        &self,
        uri: &Uri<String>,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let raw = uri.as_str();
        if let Some(rest) = raw.strip_prefix("type://") {
            let path = rest.trim_start_matches('/');
            if path.is_empty() || !path.split('/').all(is_ref_segment) {
                return Err(format!("malformed type reference '{raw}'").into());
            }
            let file = resolve_type_file(&self.types_dir, path)
                .ok_or_else(|| format!("type file for reference '{raw}' not found"))?;
            let text = std::fs::read_to_string(&file)
                .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
            let doc: Value = serde_yaml::from_str(&text)
                .map_err(|e| format!("cannot parse {}: {e}", file.display()))?;
            Ok(doc)
        } else if raw.starts_with("http://json-schema.org/draft-07/") {
            Ok(Value::Bool(true))
        } else {
            Err(format!("unresolvable schema reference '{raw}'").into())
        }
    }
}

/// Compiled-validator store shared by the resolver.
///
/// Compilation is cached per document schema; payload fragments are compiled
/// on demand. Every referenced type file is validated against the type schema
/// once and retained for the frozen model.
#[derive(Debug)]
pub struct SchemaStore {
    set: SchemaSet,
    types_dir: PathBuf,
    validators: Mutex<BTreeMap<SchemaKind, Arc<Validator>>>,
    types: Mutex<BTreeMap<String, Value>>,
}

impl SchemaStore {
    /// Builds a store after checking each schema document against its
    /// meta-schema.
    pub fn new(set: SchemaSet, types_dir: PathBuf) -> Result<Self, ConfigError> {
        for kind in [
            SchemaKind::Config,
            SchemaKind::Manifest,
            SchemaKind::Interface,
            SchemaKind::Type,
            SchemaKind::ErrorList,
        ] {
            jsonschema::meta::validate(set.get(kind)).map_err(|e| ConfigError {
                file: format!("{}.schema", kind.stem()),
                pointer: String::new(),
                reason: format!("not a valid draft-7 schema: {e}"),
            })?;
        }
        Ok(Self {
            set,
            types_dir,
            validators: Mutex::new(BTreeMap::new()),
            types: Mutex::new(BTreeMap::new()),
        })
    }

    fn build_validator(&self, schema: &Value) -> Result<Validator, String> {
        jsonschema::options()
            .with_draft(Draft::Draft7)
            .with_retriever(TypeRetriever {
                types_dir: self.types_dir.clone(),
            })
            .build(schema)
            .map_err(|e| e.to_string())
    }

    fn validator(&self, kind: SchemaKind) -> Result<Arc<Validator>, ConfigError> {
        let mut cache = self.validators.lock().expect("schema cache poisoned");
        if let Some(v) = cache.get(&kind) {
            return Ok(v.clone());
        }
        let validator = self.build_validator(self.set.get(kind)).map_err(|e| ConfigError {
            file: format!("{}.schema", kind.stem()),
            pointer: String::new(),
            reason: e,
        })?;
        let validator = Arc::new(validator);
        cache.insert(kind, validator.clone());
        Ok(validator)
    }

    /// Validates `instance` (read from `file`) against one of the document
    /// schemas. All violations are folded into a single `ConfigError` anchored
    /// at the first offending location.
    pub fn validate(
        &self,
        kind: SchemaKind,
        instance: &Value,
        file: &Path,
    ) -> Result<(), ConfigError> {
        let validator = self.validator(kind)?;
        let mut pointer = String::new();
        let mut reasons = Vec::new();
        for error in validator.iter_errors(instance) {
            if reasons.is_empty() {
                pointer = error.instance_path.to_string();
            }
            reasons.push(format!("{error} (at instance path '{}')", error.instance_path));
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::new(file, &pointer, reasons.join("; ")))
        }
    }

    /// Compiles a payload schema fragment (command arguments/result, variable
    /// or config-entry schema), resolving restricted type references. Every
    /// referenced type file is loaded and validated as a side effect.
    pub fn compile_fragment(
        &self,
        fragment: &Value,
        file: &Path,
        pointer: &str,
    ) -> Result<Validator, ConfigError> {
        let mut schema = fragment.clone();
        let mut referenced = BTreeSet::new();
        rewrite_type_refs(&mut schema, &mut referenced);
        for path in referenced {
            self.load_type_file(&path, file, pointer)?;
        }
        self.build_validator(&schema)
            .map_err(|e| ConfigError::new(file, pointer, format!("invalid schema: {e}")))
    }

    /// Loads and caches a type definition file referenced as `/<path>#/...`,
    /// validating it against the type schema. The cache key carries the
    /// leading slash, matching the reference form.
    pub fn load_type_file(
        &self,
        path: &str,
        referencing_file: &Path,
        pointer: &str,
    ) -> Result<(), ConfigError> {
        {
            let types = self.types.lock().expect("type cache poisoned");
            if types.contains_key(&format!("/{path}")) {
                return Ok(());
            }
        }
        let file = resolve_type_file(&self.types_dir, path).ok_or_else(|| {
            ConfigError::new(
                referencing_file,
                pointer,
                format!("type file '/{path}' not found in {}", self.types_dir.display()),
            )
        })?;
        let doc = load_document(&file)?;
        self.validate(SchemaKind::Type, &doc, &file)?;
        self.types
            .lock()
            .expect("type cache poisoned")
            .insert(format!("/{path}"), doc);
        Ok(())
    }

    /// All type definition files loaded so far, keyed by `/<path>`.
    pub fn loaded_types(&self) -> BTreeMap<String, Value> {
        self.types.lock().expect("type cache poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_schemas_are_valid_draft7() {
        let dir = tempfile::tempdir().unwrap();
        SchemaStore::new(SchemaSet::builtin(), dir.path().to_path_buf()).unwrap();
    }

    #[test]
    fn type_ref_syntax_is_restricted() {
        assert!(parse_type_ref("/energy#/Limit").is_some());
        assert!(parse_type_ref("/units/si#/Volt").is_some());
        assert!(parse_type_ref("energy#/Limit").is_none());
        assert!(parse_type_ref("/energy#Limit").is_none());
        assert!(parse_type_ref("/ener gy#/Limit").is_none());
        assert!(parse_type_ref("/energy#/Li/mit").is_none());
        assert!(parse_type_ref("http://example.com/x#/Y").is_none());
    }

    #[test]
    fn rewrites_and_records_type_refs() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "limit": { "$ref": "/energy#/Limit" },
                "plain": { "type": "number" }
            }
        });
        let mut found = BTreeSet::new();
        rewrite_type_refs(&mut schema, &mut found);
        assert_eq!(
            schema["properties"]["limit"]["$ref"],
            "type:///energy#/Limit"
        );
        assert!(found.contains("energy"));
    }

    #[test]
    fn fragment_with_unknown_remote_ref_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(SchemaSet::builtin(), dir.path().to_path_buf()).unwrap();
        let fragment = json!({ "$ref": "http://example.com/other#/X" });
        let err = store
            .compile_fragment(&fragment, Path::new("iface.yaml"), "/cmds/x")
            .unwrap_err();
        assert!(err.reason.contains("invalid schema"));
    }

    #[test]
    fn fragment_with_type_ref_resolves_from_types_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("energy.yaml"),
            "description: energy types\nLimit:\n  type: number\n  minimum: 0\n",
        )
        .unwrap();
        let store = SchemaStore::new(SchemaSet::builtin(), dir.path().to_path_buf()).unwrap();
        let fragment = json!({ "$ref": "/energy#/Limit" });
        let validator = store
            .compile_fragment(&fragment, Path::new("iface.yaml"), "/cmds/x")
            .unwrap();
        assert!(validator.is_valid(&json!(3.5)));
        assert!(!validator.is_valid(&json!(-1)));
        assert!(store.loaded_types().contains_key("/energy"));
    }
}
