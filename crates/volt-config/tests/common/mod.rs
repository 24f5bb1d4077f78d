//! Fixture trees for resolver tests.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use volt_config::Settings;

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        for sub in ["modules", "interfaces", "types", "errors"] {
            std::fs::create_dir(dir.path().join(sub)).expect("fixture subdir");
        }
        Fixture { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("fixture dir");
        }
        std::fs::write(&path, contents).expect("fixture file");
        path
    }

    pub fn config(&self, contents: &str) -> PathBuf {
        self.write("config.yaml", contents)
    }

    pub fn user_config(&self, contents: &str) -> PathBuf {
        self.write("user-config/config.yaml", contents)
    }

    pub fn manifest(&self, module_type: &str, contents: &str) -> PathBuf {
        self.write(&format!("modules/{module_type}/manifest.yaml"), contents)
    }

    pub fn interface(&self, name: &str, contents: &str) -> PathBuf {
        self.write(&format!("interfaces/{name}.yaml"), contents)
    }

    pub fn type_file(&self, name: &str, contents: &str) -> PathBuf {
        self.write(&format!("types/{name}.yaml"), contents)
    }

    pub fn error_list(&self, namespace: &str, contents: &str) -> PathBuf {
        self.write(&format!("errors/{namespace}.yaml"), contents)
    }

    pub fn settings(&self, config: &Path) -> Settings {
        Settings::for_tree(self.root(), config).expect("settings")
    }
}

/// A manifest with one `main` implementation of `interface` and no
/// requirements or config.
pub fn provider_manifest(interface: &str) -> String {
    format!(
        r#"description: Provider module
provides:
  main:
    interface: {interface}
    description: main implementation
metadata:
  license: Apache-2.0
  authors:
    - Voltgrid contributors
"#
    )
}

/// An interface with one command and one variable.
pub fn basic_interface() -> &'static str {
    r#"description: Basic test interface
cmds:
  ping:
    description: Echo a number
    arguments:
      value:
        type: integer
    result:
      type: integer
vars:
  state:
    type: string
"#
}
