//! Module process management: entrypoint probing, child descriptors and the
//! sandboxed spawn helper.

mod process;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use process::{resolve_user, spawn_module, ResolvedUser, RunningChild};

/// Lifecycle of one supervised child.
///
/// `Spawning → Alive → Ready → Terminating → Reaped` in the good case;
/// `Spawning → Failed` when exec fails. An unexpected exit from `Alive` or
/// `Ready` moves every sibling to `Terminating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    Spawning,
    Alive,
    Ready,
    Terminating,
    Reaped,
    Failed,
}

/// How a module is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    /// Native binary, invoked with `--prefix/--conf/--module` arguments.
    Native(PathBuf),
    /// `index.js`, run under `node --unhandled-rejections=strict`.
    JavaScript(PathBuf),
    /// `module.py`, run under `python3`.
    Python(PathBuf),
}

/// Everything needed to start one module instance.
#[derive(Debug, Clone)]
pub struct ModuleStartInfo {
    pub module_id: String,
    /// Diagnostic identifier, also used as argv[0] for native modules.
    pub printable_name: String,
    pub entrypoint: Entrypoint,
    /// POSIX capability names the child keeps across the user switch.
    pub capabilities: Vec<String>,
}

/// Process-wide launch parameters shared by all modules.
#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub prefix: PathBuf,
    pub config_file: PathBuf,
    pub validate_schema: bool,
    /// Pre-resolved unprivileged user to switch to, when configured.
    pub run_as_user: Option<ResolvedUser>,
    /// NODE_PATH for JavaScript modules.
    pub node_modules_dir: PathBuf,
    /// PYTHONPATH for Python modules.
    pub python_modules_dir: PathBuf,
}

/// Why a module could not be started. Any variant is fatal for the fleet.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(
        "module type '{module_type}' cannot be loaded: no binary, JavaScript or Python entrypoint found\n  checked paths:\n    binary: {binary}\n    js:     {js}\n    py:     {py}",
        binary = .binary.display(), js = .js.display(), py = .py.display()
    )]
    NoEntrypoint {
        module_type: String,
        binary: PathBuf,
        js: PathBuf,
        py: PathBuf,
    },
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("cannot resolve user '{user}': {message}")]
    UserLookup { user: String, message: String },
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
    #[error("module '{module_id}' did not complete exec(): {message}")]
    Exec { module_id: String, message: String },
    #[error("i/o error while spawning module '{module_id}': {source}")]
    Io {
        module_id: String,
        source: std::io::Error,
    },
}

/// Finds the entrypoint of a module type below the modules directory.
/// Probing order: native binary, `index.js`, `module.py`; the first hit wins.
pub fn probe_entrypoint(modules_dir: &Path, module_type: &str) -> Result<Entrypoint, SpawnError> {
    let module_dir = modules_dir.join(module_type);
    let binary = module_dir.join(module_type);
    let js = module_dir.join("index.js");
    let py = module_dir.join("module.py");

    if binary.is_file() {
        Ok(Entrypoint::Native(binary))
    } else if js.is_file() {
        Ok(Entrypoint::JavaScript(js))
    } else if py.is_file() {
        Ok(Entrypoint::Python(py))
    } else {
        Err(SpawnError::NoEntrypoint {
            module_type: module_type.to_string(),
            binary,
            js,
            py,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn probing_prefers_native_over_js_over_python() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        touch(&root.join("T/module.py"));
        assert!(matches!(
            probe_entrypoint(root, "T").unwrap(),
            Entrypoint::Python(_)
        ));

        touch(&root.join("T/index.js"));
        assert!(matches!(
            probe_entrypoint(root, "T").unwrap(),
            Entrypoint::JavaScript(_)
        ));

        touch(&root.join("T/T"));
        assert!(matches!(
            probe_entrypoint(root, "T").unwrap(),
            Entrypoint::Native(_)
        ));
    }

    #[test]
    fn absent_entrypoints_name_all_checked_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = probe_entrypoint(dir.path(), "ghost").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ghost"));
        assert!(text.contains("index.js"));
        assert!(text.contains("module.py"));
    }
}
