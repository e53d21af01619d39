//! Public data model for sandbox configuration.
//!
//! This module defines the configuration types shared by the CLI, the
//! JSON-RPC surface, and the sandbox controller:
//! - [`Config`] with resources, network policy, and VFS layout
//! - [`Secret`] with MITM placeholder substitution metadata
//! - [`MountConfig`] variants (`real_fs` host binds and `memory` trees)
//! - parsers for the `NAME=VALUE@host1,host2` secret syntax and the
//!   `HOST:GUEST[:ro]` volume syntax
//!
//! # Secrets and placeholders
//!
//! A secret's real value never enters the guest. At parse time each secret
//! is assigned an opaque placeholder token derived from its name plus fresh
//! entropy; the guest environment carries `NAME=<placeholder>` and the MITM
//! proxy swaps the placeholder for the real value in request headers bound
//! for the secret's allowed hosts.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Default guest mount point for the VFS tree.
pub const DEFAULT_WORKSPACE: &str = "/workspace";

/// Default number of virtual CPUs.
pub const DEFAULT_CPUS: u32 = 1;

/// Default guest memory in MB.
pub const DEFAULT_MEMORY_MB: u32 = 512;

/// Default scratch disk size in MB.
pub const DEFAULT_DISK_SIZE_MB: u32 = 2048;

/// Default command timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Minimum guest memory the controller accepts.
pub const MIN_MEMORY_MB: u32 = 128;

/// Errors produced while parsing or validating configuration.
///
/// These surface before any side effect: a sandbox whose config does not
/// validate never spawns a VMM or touches the state directory.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("image reference is required")]
    MissingImage,

    #[error("at least {MIN_MEMORY_MB} MB of memory is required, got {0}")]
    MemoryTooSmall(u32),

    #[error("at least 1 CPU is required")]
    NoCpus,

    #[error("invalid secret {input:?}: {reason}")]
    InvalidSecret { input: String, reason: String },

    #[error("invalid volume mount {input:?}: {reason}")]
    InvalidVolume { input: String, reason: String },

    #[error("invalid host pattern {pattern:?}: {reason}")]
    InvalidHostPattern { pattern: String, reason: String },

    #[error("mount path {0:?} must be an absolute guest path under the workspace")]
    MountOutsideWorkspace(String),

    #[error("mount path {child:?} nests under {missing:?} which has no mount entry")]
    MissingParentMount { child: String, missing: String },
}

/// Top-level sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Container image reference the rootfs was built from.
    pub image: String,
    /// Skip in-guest security restrictions (seccomp, cap drop, no_new_privs).
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub vfs: VfsConfig,
}

/// CPU, memory, disk, and timeout limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u32,
    pub timeout_seconds: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: DEFAULT_CPUS,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_size_mb: DEFAULT_DISK_SIZE_MB,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

/// Network policy inputs for the interception stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Allowed host patterns (`*`, `*.suffix`, `prefix-*.suffix`, literals).
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Deny connections that resolve to RFC1918/loopback/link-local/CGNAT.
    #[serde(default = "default_true")]
    pub block_private_ips: bool,
    /// Secrets keyed by name.
    #[serde(default)]
    pub secrets: HashMap<String, Secret>,
}

fn default_true() -> bool {
    true
}

/// A secret injected via MITM substitution.
///
/// The value is never serialized into the on-disk state record; `config.json`
/// under the sandbox state directory carries only the placeholder and host
/// set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Real secret value. Host-process memory only.
    #[serde(skip_serializing, default)]
    pub value: String,
    /// Opaque token the guest sees instead of the value.
    pub placeholder: String,
    /// Host patterns the substitution applies to.
    pub hosts: Vec<String>,
}

/// VFS layout: workspace root plus the mount table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsConfig {
    pub workspace: String,
    /// Mounts keyed by absolute guest path. Ordered map so longest-prefix
    /// resolution and validation are deterministic.
    #[serde(default)]
    pub mounts: BTreeMap<String, MountConfig>,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            workspace: DEFAULT_WORKSPACE.to_string(),
            mounts: BTreeMap::new(),
        }
    }
}

/// One mount table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountConfig {
    /// Bind a host directory into the guest tree.
    RealFs {
        host_path: PathBuf,
        #[serde(default)]
        readonly: bool,
    },
    /// In-memory tree private to the sandbox, initially empty.
    Memory {},
}

/// Options for a single exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory inside the guest. Defaults to the workspace.
    pub working_dir: Option<String>,
    /// Extra environment entries, on top of the secret placeholders.
    pub env: HashMap<String, String>,
    /// Bytes fed to the command's stdin, then closed.
    pub stdin: Option<Vec<u8>>,
}

/// Result of a buffered or streaming exec.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl Config {
    /// Validate the configuration without touching the VMM.
    ///
    /// Checks resource floors, mount-path shape and nesting, and that every
    /// secret and allowlist host pattern parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::MissingImage);
        }
        if self.resources.cpus < 1 {
            return Err(ConfigError::NoCpus);
        }
        if self.resources.memory_mb < MIN_MEMORY_MB {
            return Err(ConfigError::MemoryTooSmall(self.resources.memory_mb));
        }

        for pattern in &self.network.allowed_hosts {
            crate::net::policy::HostPattern::parse(pattern).map_err(|reason| {
                ConfigError::InvalidHostPattern {
                    pattern: pattern.clone(),
                    reason,
                }
            })?;
        }
        for secret in self.network.secrets.values() {
            for pattern in &secret.hosts {
                crate::net::policy::HostPattern::parse(pattern).map_err(|reason| {
                    ConfigError::InvalidHostPattern {
                        pattern: pattern.clone(),
                        reason,
                    }
                })?;
            }
        }

        let workspace = Path::new(&self.vfs.workspace);
        for (guest_path, _) in &self.vfs.mounts {
            let path = Path::new(guest_path);
            if !path.is_absolute()
                || normalize_guest_path(path).is_none()
                || (!path.starts_with(workspace) && path != workspace)
            {
                return Err(ConfigError::MountOutsideWorkspace(guest_path.clone()));
            }
            if path != workspace {
                let parent = path.parent().unwrap_or(workspace);
                let covered = self
                    .vfs
                    .mounts
                    .keys()
                    .any(|m| parent.starts_with(Path::new(m)))
                    || parent == workspace
                    || workspace.starts_with(parent);
                if !covered {
                    return Err(ConfigError::MissingParentMount {
                        child: guest_path.clone(),
                        missing: parent.to_string_lossy().into_owned(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Ensure the workspace root itself has a mount entry.
    ///
    /// The guest FUSE driver mounts the workspace root; if the user only gave
    /// submounts (or none), back the root with a private memory tree.
    pub fn normalize(&mut self) {
        let workspace = self.vfs.workspace.clone();
        self.vfs
            .mounts
            .entry(workspace)
            .or_insert(MountConfig::Memory {});
    }
}

/// Parse a secret flag: `NAME=VALUE@host1,host2` or `NAME@host1,host2`.
///
/// The second form reads the value from the environment variable `NAME`.
pub fn parse_secret(input: &str) -> Result<(String, Secret), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSecret {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let (name_value, hosts) = input
        .rsplit_once('@')
        .ok_or_else(|| invalid("missing @host list"))?;
    if hosts.is_empty() {
        return Err(invalid("empty host list"));
    }

    let (name, value) = match name_value.split_once('=') {
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => {
            let name = name_value.to_string();
            let value = std::env::var(&name)
                .map_err(|_| invalid(&format!("environment variable {name} is not set")))?;
            (name, value)
        }
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("name must be alphanumeric/underscore"));
    }

    let hosts: Vec<String> = hosts.split(',').map(|h| h.trim().to_string()).collect();
    if hosts.iter().any(|h| h.is_empty()) {
        return Err(invalid("empty host pattern in list"));
    }

    let placeholder = generate_placeholder(&name);
    Ok((
        name,
        Secret {
            value,
            placeholder,
            hosts,
        },
    ))
}

/// Generate the opaque placeholder token for a secret.
///
/// Seeded by the name (never the value) plus 16 bytes of fresh entropy, so
/// tokens are unique per sandbox and carry no printable-control characters.
pub fn generate_placeholder(name: &str) -> String {
    let mut entropy = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut entropy);
    let hex: String = entropy.iter().map(|b| format!("{b:02x}")).collect();
    format!("MLSK_{name}_{hex}")
}

/// Parse a volume flag: `HOST:GUEST[:ro]`.
///
/// A relative guest path is resolved under the workspace.
pub fn parse_volume(input: &str, workspace: &str) -> Result<(String, MountConfig), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidVolume {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = input.split(':').collect();
    let (host, guest, readonly) = match parts.as_slice() {
        [host, guest] => (*host, *guest, false),
        [host, guest, "ro"] => (*host, *guest, true),
        [_, _, other] => return Err(invalid(&format!("unknown mount option {other:?}"))),
        _ => return Err(invalid("expected HOST:GUEST[:ro]")),
    };
    if host.is_empty() || guest.is_empty() {
        return Err(invalid("host and guest paths must be non-empty"));
    }

    let host_path = std::fs::canonicalize(host)
        .map_err(|e| invalid(&format!("host path {host:?}: {e}")))?;

    let guest_path = if Path::new(guest).is_absolute() {
        guest.to_string()
    } else {
        format!("{}/{}", workspace.trim_end_matches('/'), guest)
    };
    let guest_path = normalize_guest_path(Path::new(&guest_path))
        .ok_or_else(|| invalid("guest path escapes the workspace"))?;

    Ok((
        guest_path.to_string_lossy().into_owned(),
        MountConfig::RealFs {
            host_path,
            readonly,
        },
    ))
}

/// Lexically normalize a guest path, rejecting `..` traversal.
pub fn normalize_guest_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push("/"),
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Join command arguments into one shell-safe string for the guest.
pub fn shell_join(args: &[String]) -> String {
    shell_words::join(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            image: "alpine:latest".to_string(),
            privileged: false,
            resources: Resources::default(),
            network: NetworkConfig::default(),
            vfs: VfsConfig::default(),
        }
    }

    #[test]
    fn test_parse_secret_inline() {
        let (name, secret) = parse_secret("TOKEN=supersecret@api.example.com,*.internal").unwrap();
        assert_eq!(name, "TOKEN");
        assert_eq!(secret.value, "supersecret");
        assert_eq!(secret.hosts, vec!["api.example.com", "*.internal"]);
        assert!(secret.placeholder.starts_with("MLSK_TOKEN_"));
        assert_ne!(secret.placeholder, secret.value);
    }

    #[test]
    fn test_parse_secret_from_env() {
        std::env::set_var("MATCHLOCK_TEST_SECRET", "from-env");
        let (name, secret) = parse_secret("MATCHLOCK_TEST_SECRET@example.com").unwrap();
        assert_eq!(name, "MATCHLOCK_TEST_SECRET");
        assert_eq!(secret.value, "from-env");
    }

    #[test]
    fn test_parse_secret_missing_hosts() {
        assert!(parse_secret("TOKEN=value").is_err());
        assert!(parse_secret("TOKEN=value@").is_err());
    }

    #[test]
    fn test_placeholder_unique_per_call() {
        let a = generate_placeholder("TOKEN");
        let b = generate_placeholder("TOKEN");
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_volume_relative_guest() {
        let dir = tempfile::tempdir().unwrap();
        let input = format!("{}:data:ro", dir.path().display());
        let (guest, mount) = parse_volume(&input, "/workspace").unwrap();
        assert_eq!(guest, "/workspace/data");
        match mount {
            MountConfig::RealFs { readonly, .. } => assert!(readonly),
            _ => panic!("expected real_fs mount"),
        }
    }

    #[test]
    fn test_parse_volume_bad_option() {
        let dir = tempfile::tempdir().unwrap();
        let input = format!("{}:data:rw2", dir.path().display());
        assert!(parse_volume(&input, "/workspace").is_err());
    }

    #[test]
    fn test_parse_volume_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = format!("{}:../../etc", dir.path().display());
        assert!(parse_volume(&input, "/workspace").is_err());
    }

    #[test]
    fn test_validate_memory_floor() {
        let mut config = base_config();
        config.resources.memory_mb = 64;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MemoryTooSmall(64))
        ));
    }

    #[test]
    fn test_validate_bad_host_pattern() {
        let mut config = base_config();
        config.network.allowed_hosts.push("a*b*c.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_mount_nesting_requires_parent() {
        let mut config = base_config();
        config.vfs.mounts.insert(
            "/workspace/a/b".to_string(),
            MountConfig::Memory {},
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingParentMount { .. })
        ));

        config
            .vfs
            .mounts
            .insert("/workspace/a".to_string(), MountConfig::Memory {});
        config.validate().unwrap();
    }

    #[test]
    fn test_normalize_inserts_workspace_root() {
        let mut config = base_config();
        assert!(config.vfs.mounts.is_empty());
        config.normalize();
        assert!(matches!(
            config.vfs.mounts.get("/workspace"),
            Some(MountConfig::Memory {})
        ));
    }

    #[test]
    fn test_secret_value_not_serialized() {
        let (_, secret) = parse_secret("TOKEN=topsecret@example.com").unwrap();
        let json = serde_json::to_string(&secret).unwrap();
        assert!(!json.contains("topsecret"));
        assert!(json.contains(&secret.placeholder));
    }
}
