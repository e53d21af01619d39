//! Per-sandbox state directory bookkeeping.
//!
//! Every sandbox owns one directory under the state root:
//!
//! ```text
//! <root>/<vm-id>/
//!   status       one of creating|running|stopping|stopped|crashed
//!   config.json  the sandbox config (secret values redacted)
//!   pid          VMM process id
//!   exec.sock    exec-relay listener (present while running)
//! ```
//!
//! The controller is the single writer; other CLI invocations read these
//! files concurrently. All writes go through a temp file plus atomic rename
//! so readers never observe partial content.

use crate::api::Config;
use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from state directory operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("sandbox {0} not found")]
    NotFound(String),

    #[error("sandbox {id} is {status}, refusing to remove (kill it first)")]
    StillRunning { id: String, status: Status },

    #[error("sandbox {id} is not running (status: {status})")]
    NotRunning { id: String, status: Status },

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state record: {0}")]
    Corrupt(String),
}

/// Sandbox lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Creating => "creating",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "creating" => Ok(Status::Creating),
            "running" => Ok(Status::Running),
            "stopping" => Ok(Status::Stopping),
            "stopped" => Ok(Status::Stopped),
            "crashed" => Ok(Status::Crashed),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// One sandbox's persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmState {
    pub id: String,
    pub status: Status,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub pid: u32,
}

/// Manager over the on-disk state root.
#[derive(Debug, Clone)]
pub struct Manager {
    root: PathBuf,
}

impl Manager {
    /// Use the default state root (`$MATCHLOCK_STATE_DIR` or `~/.matchlock/vms`).
    pub fn new() -> Self {
        let root = std::env::var_os("MATCHLOCK_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| {
                    PathBuf::from("/tmp")
                });
                home.join(".matchlock").join("vms")
            });
        Self { root }
    }

    /// Use an explicit state root (tests, embedding).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one sandbox.
    pub fn vm_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Path of the exec-relay socket for one sandbox.
    pub fn exec_socket_path(&self, id: &str) -> PathBuf {
        self.vm_dir(id).join("exec.sock")
    }

    /// Create the state directory for a new sandbox.
    pub fn create(&self, id: &str, config: &Config) -> Result<(), StateError> {
        let dir = self.vm_dir(id);
        fs::create_dir_all(&dir)?;
        set_mode(&dir, 0o700)?;
        atomic_write(&dir.join("config.json"), &serde_json::to_vec_pretty(config)?)?;
        atomic_write(&dir.join("status"), Status::Creating.to_string().as_bytes())?;
        Ok(())
    }

    /// Persist a status transition.
    pub fn set_status(&self, id: &str, status: Status) -> Result<(), StateError> {
        let dir = self.vm_dir(id);
        if !dir.exists() {
            return Err(StateError::NotFound(id.to_string()));
        }
        atomic_write(&dir.join("status"), status.to_string().as_bytes())?;
        debug!(id, %status, "status updated");
        Ok(())
    }

    /// Persist the VMM pid.
    pub fn set_pid(&self, id: &str, pid: u32) -> Result<(), StateError> {
        atomic_write(&self.vm_dir(id).join("pid"), pid.to_string().as_bytes())?;
        Ok(())
    }

    /// Load one sandbox record, reconciling `running` against process liveness.
    pub fn get(&self, id: &str) -> Result<VmState, StateError> {
        let dir = self.vm_dir(id);
        if !dir.exists() {
            return Err(StateError::NotFound(id.to_string()));
        }
        let status: Status = fs::read_to_string(dir.join("status"))
            .map_err(|_| StateError::NotFound(id.to_string()))?
            .parse()
            .map_err(StateError::Corrupt)?;
        let pid: u32 = fs::read_to_string(dir.join("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let image = self
            .config(id)
            .map(|c| c.image)
            .unwrap_or_else(|_| String::from("<unknown>"));
        let created_at = fs::metadata(&dir)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut record = VmState {
            id: id.to_string(),
            status,
            image,
            created_at,
            pid,
        };
        if record.status == Status::Running && record.pid > 0 && !process_alive(record.pid) {
            warn!(id, pid = record.pid, "VMM process is gone, marking crashed");
            record.status = Status::Crashed;
            let _ = self.set_status(id, Status::Crashed);
        }
        Ok(record)
    }

    /// List all sandbox records, newest first.
    pub fn list(&self) -> Result<Vec<VmState>, StateError> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("vm-") {
                continue;
            }
            match self.get(&name) {
                Ok(record) => out.push(record),
                Err(e) => debug!(id = %name, error = %e, "skipping unreadable state entry"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Load the persisted config for a sandbox.
    pub fn config(&self, id: &str) -> Result<Config, StateError> {
        let raw = fs::read(self.vm_dir(id).join("config.json"))
            .map_err(|_| StateError::NotFound(id.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| StateError::Corrupt(e.to_string()))
    }

    /// Kill a running sandbox's VMM process: SIGTERM, then SIGKILL.
    pub fn kill(&self, id: &str) -> Result<(), StateError> {
        let record = self.get(id)?;
        if record.status != Status::Running || record.pid == 0 {
            return Err(StateError::NotRunning {
                id: id.to_string(),
                status: record.status,
            });
        }
        let pid = Pid::from_raw(record.pid as i32);
        let _ = kill(pid, Signal::SIGTERM);
        for _ in 0..20 {
            if !process_alive(record.pid) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        if process_alive(record.pid) {
            let _ = kill(pid, Signal::SIGKILL);
        }
        self.set_status(id, Status::Stopped)?;
        Ok(())
    }

    /// Remove a stopped sandbox's state directory.
    ///
    /// A missing ID is an error; a running sandbox is refused without
    /// touching anything.
    pub fn remove(&self, id: &str) -> Result<(), StateError> {
        let dir = self.vm_dir(id);
        if !dir.exists() {
            return Err(StateError::NotFound(id.to_string()));
        }
        let status = fs::read_to_string(dir.join("status"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Status::Stopped);
        if matches!(status, Status::Running | Status::Stopping) {
            // Re-check liveness: a crashed controller can leave a stale
            // "running" record behind.
            let record = self.get(id)?;
            if matches!(record.status, Status::Running | Status::Stopping) {
                return Err(StateError::StillRunning {
                    id: id.to_string(),
                    status: record.status,
                });
            }
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Remove every stopped or crashed sandbox; returns the removed IDs.
    pub fn prune(&self) -> Result<Vec<String>, StateError> {
        let mut removed = Vec::new();
        for record in self.list()? {
            if matches!(record.status, Status::Stopped | Status::Crashed) {
                match self.remove(&record.id) {
                    Ok(()) => removed.push(record.id),
                    Err(e) => warn!(id = %record.id, error = %e, "prune failed"),
                }
            }
        }
        Ok(removed)
    }

}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Corrupt(e.to_string())
    }
}

/// Write via temp file + rename so concurrent readers never see partial data.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Signal-0 probe for process liveness.
fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Generate a fresh sandbox ID: `vm-` plus 8 hex chars.
pub fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap()
        })
        .collect();
    format!("vm-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Config, NetworkConfig, Resources, VfsConfig};

    fn test_config() -> Config {
        Config {
            image: "alpine:latest".to_string(),
            privileged: false,
            resources: Resources::default(),
            network: NetworkConfig::default(),
            vfs: VfsConfig::default(),
        }
    }

    fn test_manager() -> (tempfile::TempDir, Manager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Manager::with_root(dir.path());
        (dir, mgr)
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert!(id.starts_with("vm-"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_remove_nonexistent_vm() {
        let (_dir, mgr) = test_manager();
        let err = mgr.remove("vm-nonexistent").unwrap_err();
        assert!(matches!(err, StateError::NotFound(ref id) if id == "vm-nonexistent"));
        assert!(err.to_string().contains("vm-nonexistent"));
    }

    #[test]
    fn test_remove_stopped_vm() {
        let (_dir, mgr) = test_manager();
        mgr.create("vm-test1234", &test_config()).unwrap();
        mgr.set_status("vm-test1234", Status::Stopped).unwrap();

        mgr.remove("vm-test1234").unwrap();
        assert!(!mgr.vm_dir("vm-test1234").exists());
    }

    #[test]
    fn test_remove_running_vm_refused() {
        let (_dir, mgr) = test_manager();
        mgr.create("vm-running1", &test_config()).unwrap();
        // Use our own (live) pid so the liveness re-check keeps it "running".
        mgr.set_pid("vm-running1", std::process::id()).unwrap();
        mgr.set_status("vm-running1", Status::Running).unwrap();

        let err = mgr.remove("vm-running1").unwrap_err();
        assert!(matches!(err, StateError::StillRunning { .. }));
        assert!(mgr.vm_dir("vm-running1").exists());
    }

    #[test]
    fn test_stale_running_record_marked_crashed() {
        let (_dir, mgr) = test_manager();
        mgr.create("vm-stale001", &test_config()).unwrap();
        // A pid far above any real pid_max keeps the probe deterministic.
        mgr.set_pid("vm-stale001", 999_999_999).unwrap();
        mgr.set_status("vm-stale001", Status::Running).unwrap();

        let record = mgr.get("vm-stale001").unwrap();
        assert_eq!(record.status, Status::Crashed);
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let (_dir, mgr) = test_manager();
        mgr.create("vm-aaaa0001", &test_config()).unwrap();
        mgr.create("vm-bbbb0002", &test_config()).unwrap();
        std::fs::create_dir_all(mgr.root().join("not-a-vm")).unwrap();

        let all = mgr.list().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_prune_removes_only_stopped() {
        let (_dir, mgr) = test_manager();
        mgr.create("vm-stop0001", &test_config()).unwrap();
        mgr.set_status("vm-stop0001", Status::Stopped).unwrap();
        mgr.create("vm-runn0001", &test_config()).unwrap();
        mgr.set_pid("vm-runn0001", std::process::id()).unwrap();
        mgr.set_status("vm-runn0001", Status::Running).unwrap();

        let pruned = mgr.prune().unwrap();
        assert_eq!(pruned, vec!["vm-stop0001".to_string()]);
        assert!(mgr.vm_dir("vm-runn0001").exists());
    }

    #[test]
    fn test_config_roundtrip_redacts_secrets() {
        let (_dir, mgr) = test_manager();
        let mut config = test_config();
        let (name, secret) = crate::api::parse_secret("TOKEN=sekrit@example.com").unwrap();
        config.network.secrets.insert(name, secret);
        mgr.create("vm-sec00001", &config).unwrap();

        let raw = std::fs::read_to_string(mgr.vm_dir("vm-sec00001").join("config.json")).unwrap();
        assert!(!raw.contains("sekrit"));
        let loaded = mgr.config("vm-sec00001").unwrap();
        assert!(loaded.network.secrets.contains_key("TOKEN"));
    }
}
