//! The fork/exec helper.
//!
//! This is the only place where process-global state meets threads, so the
//! whole sequence is kept in one spot: a one-shot `O_CLOEXEC` pipe for
//! pre-exec error reporting, a pre-exec hook that must not allocate (parent
//! death signal, ambient capabilities, user switch - all inputs are resolved
//! in the parent beforehand), and the exec itself. A zero-byte close of the
//! pipe means the child reached exec; any bytes are its error report.

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::str::FromStr;

use nix::fcntl::OFlag;
use tokio::process::Command;
use tracing::debug;

use crate::{Entrypoint, ModuleStartInfo, SpawnContext, SpawnError};

/// Passwd data resolved in the parent, before any fork.
#[derive(Debug, Clone)]
pub struct ResolvedUser {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
}

/// Looks up a user and its supplementary groups.
pub fn resolve_user(name: &str) -> Result<ResolvedUser, SpawnError> {
    let entry = nix::unistd::User::from_name(name)
        .map_err(|e| SpawnError::UserLookup {
            user: name.to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| SpawnError::UnknownUser(name.to_string()))?;
    let cname = std::ffi::CString::new(name).map_err(|e| SpawnError::UserLookup {
        user: name.to_string(),
        message: e.to_string(),
    })?;
    let groups = nix::unistd::getgrouplist(&cname, entry.gid).map_err(|e| SpawnError::UserLookup {
        user: name.to_string(),
        message: e.to_string(),
    })?;
    Ok(ResolvedUser {
        name: name.to_string(),
        uid: entry.uid.as_raw(),
        gid: entry.gid.as_raw(),
        groups: groups.iter().map(|g| g.as_raw()).collect(),
    })
}

/// A spawned module process.
#[derive(Debug)]
pub struct RunningChild {
    pub module_id: String,
    pub child: tokio::process::Child,
}

impl RunningChild {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

fn parse_capabilities(names: &[String]) -> Result<Vec<caps::Capability>, SpawnError> {
    names
        .iter()
        .map(|name| {
            caps::Capability::from_str(name)
                .map_err(|_| SpawnError::UnknownCapability(name.clone()))
        })
        .collect()
}

fn build_command(info: &ModuleStartInfo, ctx: &SpawnContext) -> Command {
    match &info.entrypoint {
        Entrypoint::Native(path) => {
            let mut cmd = Command::new(path);
            cmd.as_std_mut().arg0(&info.printable_name);
            cmd.arg("--prefix")
                .arg(&ctx.prefix)
                .arg("--conf")
                .arg(&ctx.config_file)
                .arg("--module")
                .arg(&info.module_id);
            cmd
        }
        Entrypoint::JavaScript(path) => {
            let mut cmd = Command::new("node");
            cmd.arg("--unhandled-rejections=strict").arg(path);
            cmd.env("NODE_PATH", &ctx.node_modules_dir);
            module_env(&mut cmd, info, ctx);
            cmd
        }
        Entrypoint::Python(path) => {
            let mut cmd = Command::new("python3");
            cmd.arg(path);
            cmd.env("PYTHONPATH", &ctx.python_modules_dir);
            module_env(&mut cmd, info, ctx);
            cmd
        }
    }
}

fn module_env(cmd: &mut Command, info: &ModuleStartInfo, ctx: &SpawnContext) {
    cmd.env("EV_MODULE", &info.module_id);
    cmd.env("EV_PREFIX", &ctx.prefix);
    cmd.env("EV_CONF_FILE", &ctx.config_file);
    if ctx.validate_schema {
        cmd.env("EV_VALIDATE_SCHEMA", "1");
    } else {
        cmd.env("EV_DONT_VALIDATE_SCHEMA", "1");
    }
}

/// Writes a static failure marker to the report pipe and returns the errno
/// that caused it. Runs between fork and exec; must not allocate.
fn report_failure(fd: RawFd, message: &'static [u8]) -> std::io::Error {
    let err = std::io::Error::last_os_error();
    unsafe {
        libc::write(fd, message.as_ptr().cast(), message.len());
    }
    err
}

/// Reads the child's pre-exec report. Blocks until the write end closes,
/// which happens at exec (`O_CLOEXEC`) or at child exit.
fn read_exec_report(fd: OwnedFd) -> String {
    let mut file = std::fs::File::from(fd);
    let mut report = String::new();
    let _ = file.read_to_string(&mut report);
    report.trim().to_string()
}

/// Spawns one module process.
///
/// In the child, before exec: request SIGTERM on parent death and re-check
/// the parent pid to close the race; raise the requested capabilities into
/// the ambient set; drop to the configured user (groups, gid, uid, in that
/// order). Exec failures and pre-exec failures surface as
/// [`SpawnError::Exec`] carrying the child's report.
pub fn spawn_module(info: &ModuleStartInfo, ctx: &SpawnContext) -> Result<RunningChild, SpawnError> {
    let capabilities = parse_capabilities(&info.capabilities)?;

    let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| SpawnError::Io {
        module_id: info.module_id.clone(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    let mut cmd = build_command(info, ctx);

    let parent_pid = unsafe { libc::getpid() };
    let report_fd = write_fd.as_raw_fd();
    let user = ctx.run_as_user.clone();
    unsafe {
        cmd.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(report_failure(report_fd, b"prctl(PR_SET_PDEATHSIG) failed"));
            }
            if libc::getppid() != parent_pid {
                // parent died between fork and prctl; behave as if the death
                // signal had been delivered
                libc::raise(libc::SIGTERM);
            }
            if !capabilities.is_empty() {
                if caps::securebits::set_keepcaps(true).is_err() {
                    return Err(report_failure(report_fd, b"setting keep-caps failed"));
                }
                for cap in &capabilities {
                    if caps::raise(None, caps::CapSet::Inheritable, *cap).is_err() {
                        return Err(report_failure(
                            report_fd,
                            b"raising inheritable capability failed",
                        ));
                    }
                    if caps::raise(None, caps::CapSet::Ambient, *cap).is_err() {
                        return Err(report_failure(
                            report_fd,
                            b"raising ambient capability failed",
                        ));
                    }
                }
            }
            if let Some(user) = &user {
                if libc::setgroups(user.groups.len(), user.groups.as_ptr()) != 0 {
                    return Err(report_failure(report_fd, b"setgroups failed"));
                }
                if libc::setgid(user.gid) != 0 {
                    return Err(report_failure(report_fd, b"setgid failed"));
                }
                if libc::setuid(user.uid) != 0 {
                    return Err(report_failure(report_fd, b"setuid failed"));
                }
            }
            Ok(())
        });
    }

    let spawned = cmd.spawn();
    drop(write_fd);

    match spawned {
        Err(source) => {
            let detail = read_exec_report(read_fd);
            let message = if detail.is_empty() {
                source.to_string()
            } else {
                format!("{detail} ({source})")
            };
            Err(SpawnError::Exec {
                module_id: info.module_id.clone(),
                message,
            })
        }
        Ok(mut child) => {
            let report = read_exec_report(read_fd);
            if report.is_empty() {
                debug!(module_id = %info.module_id, pid = ?child.id(), "module spawned");
                Ok(RunningChild {
                    module_id: info.module_id.clone(),
                    child,
                })
            } else {
                let _ = child.start_kill();
                Err(SpawnError::Exec {
                    module_id: info.module_id.clone(),
                    message: report,
                })
            }
        }
    }
}
