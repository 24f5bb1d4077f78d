//! Fleet supervision: spawning, exit tracking and teardown.
//!
//! Each spawned child gets a monitor task that funnels its exit status into
//! one channel; the boot loop consumes that channel. Teardown sends SIGTERM
//! to every child and escalates to SIGKILL after the grace period.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use volt_runtime::{spawn_module, ChildState, ModuleStartInfo, SpawnContext, SpawnError};

/// One child's exit, as seen by the monitor task.
#[derive(Debug)]
pub struct ExitEvent {
    pub module_id: String,
    pub pid: u32,
    pub status: Option<ExitStatus>,
}

struct ChildRecord {
    pid: u32,
    state: ChildState,
}

/// The set of running module processes.
pub struct Fleet {
    children: HashMap<String, ChildRecord>,
    exits_tx: mpsc::UnboundedSender<ExitEvent>,
    exits_rx: mpsc::UnboundedReceiver<ExitEvent>,
    grace: Duration,
}

impl Fleet {
    pub fn new(grace: Duration) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            children: HashMap::new(),
            exits_tx,
            exits_rx,
            grace,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Spawns a module and starts its monitor task.
    pub fn spawn(&mut self, info: &ModuleStartInfo, ctx: &SpawnContext) -> Result<(), SpawnError> {
        let running = spawn_module(info, ctx)?;
        let pid = running.pid().unwrap_or_default();
        debug!(module_id = %info.module_id, pid, "forked module");

        let exits = self.exits_tx.clone();
        let module_id = running.module_id.clone();
        let mut child = running.child;
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let _ = exits.send(ExitEvent {
                module_id,
                pid,
                status,
            });
        });

        self.children.insert(
            info.module_id.clone(),
            ChildRecord {
                pid,
                state: ChildState::Alive,
            },
        );
        Ok(())
    }

    /// Next exit of a tracked child. Stale events from earlier teardowns are
    /// swallowed.
    pub async fn next_exit(&mut self) -> ExitEvent {
        loop {
            let event = self
                .exits_rx
                .recv()
                .await
                .expect("fleet keeps a sender alive");
            if self.children.remove(&event.module_id).is_some() {
                return event;
            }
            debug!(module_id = %event.module_id, "ignoring exit of untracked child");
        }
    }

    /// Terminates every child: SIGTERM first, SIGKILL for whatever survives
    /// the grace period, then waits for the reaper to confirm.
    pub async fn shutdown(&mut self) {
        if self.children.is_empty() {
            return;
        }

        for (module_id, record) in self.children.iter_mut() {
            record.state = ChildState::Terminating;
            if record.pid == 0 {
                continue;
            }
            match kill(Pid::from_raw(record.pid as i32), Signal::SIGTERM) {
                Ok(()) => info!(module_id = %module_id, pid = record.pid, "sent SIGTERM"),
                Err(e) => {
                    error!(module_id = %module_id, pid = record.pid, error = %e, "SIGTERM failed")
                }
            }
        }

        let deadline = Instant::now() + self.grace;
        while !self.children.is_empty() {
            match timeout_at(deadline, self.exits_rx.recv()).await {
                Ok(Some(event)) => {
                    if self.children.remove(&event.module_id).is_some() {
                        info!(module_id = %event.module_id, status = ?event.status, "module exited");
                    }
                }
                Ok(None) => return,
                Err(_) => break,
            }
        }

        if self.children.is_empty() {
            return;
        }

        for (module_id, record) in self.children.iter() {
            error!(
                module_id = %module_id,
                pid = record.pid,
                state = ?record.state,
                "child ignored SIGTERM within grace period, escalating to SIGKILL"
            );
            if let Err(e) = kill(Pid::from_raw(record.pid as i32), Signal::SIGKILL) {
                error!(module_id = %module_id, pid = record.pid, error = %e, "SIGKILL failed");
            }
        }

        // confirm the kills; bounded so an unreapable child cannot hang us
        while !self.children.is_empty() {
            match timeout(Duration::from_secs(5), self.exits_rx.recv()).await {
                Ok(Some(event)) => {
                    self.children.remove(&event.module_id);
                }
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        remaining = self.children.len(),
                        "giving up waiting for killed children"
                    );
                    self.children.clear();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use volt_runtime::Entrypoint;

    fn script_module(dir: &Path, module_id: &str, body: &str) -> ModuleStartInfo {
        let module_dir = dir.join(module_id);
        std::fs::create_dir_all(&module_dir).unwrap();
        let path = module_dir.join(module_id);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ModuleStartInfo {
            module_id: module_id.into(),
            printable_name: module_id.into(),
            entrypoint: Entrypoint::Native(path),
            capabilities: Vec::new(),
        }
    }

    fn context(dir: &Path) -> SpawnContext {
        SpawnContext {
            prefix: dir.to_path_buf(),
            config_file: dir.join("config.yaml"),
            validate_schema: true,
            run_as_user: None,
            node_modules_dir: dir.join("node_modules"),
            python_modules_dir: dir.join("python"),
        }
    }

    #[tokio::test]
    async fn exit_of_a_child_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut fleet = Fleet::new(Duration::from_secs(5));
        let info = script_module(dir.path(), "short", "#!/bin/sh\nexit 3\n");
        fleet.spawn(&info, &context(dir.path())).unwrap();

        let event = timeout(Duration::from_secs(5), fleet.next_exit())
            .await
            .expect("exit not observed");
        assert_eq!(event.module_id, "short");
        assert_eq!(event.status.and_then(|s| s.code()), Some(3));
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn shutdown_terminates_long_running_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut fleet = Fleet::new(Duration::from_secs(5));
        let info = script_module(dir.path(), "sleeper", "#!/bin/sh\nexec sleep 600\n");
        fleet.spawn(&info, &context(dir.path())).unwrap();
        assert_eq!(fleet.len(), 1);

        timeout(Duration::from_secs(10), fleet.shutdown())
            .await
            .expect("shutdown hung");
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn shutdown_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let mut fleet = Fleet::new(Duration::from_millis(200));
        // traps and ignores SIGTERM
        let info = script_module(
            dir.path(),
            "stubborn",
            "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
        );
        fleet.spawn(&info, &context(dir.path())).unwrap();

        // give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        timeout(Duration::from_secs(10), fleet.shutdown())
            .await
            .expect("shutdown hung");
        assert!(fleet.is_empty());
    }
}
