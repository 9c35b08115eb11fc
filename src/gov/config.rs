use crate::gov::job::JobLimits;
use crate::gov::runner::ResourcePolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Effective daemon configuration: defaults overlaid with the optional YAML
/// groups from the config file.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub sock: PathBuf,
    /// Unix socket owner (username). Applied on daemon start when running as root.
    pub sock_owner: Option<String>,
    /// Unix socket group (group name). Applied on daemon start when running as root.
    pub sock_group: Option<String>,
    /// Unix socket mode (octal), e.g. 660 or "660" or "0660".
    pub sock_mode: u32,

    /// Metrics history and the persisted governor policy live here.
    pub state_directory: PathBuf,
    pub policy_file: PathBuf,

    pub tick_interval_ms: u64,

    pub cgroup_root: String,
    pub cgroup_name: String,

    pub max_runtime_ms: u64,
    pub max_log_bytes: u64,
    pub max_output_line_bytes: u64,
    pub max_child_processes: i32,
    pub kill_grace_ms: u64,
    pub max_job_starts_per_tick: usize,
    pub max_job_scans_per_tick: usize,
}

pub const MIN_TICK_INTERVAL_MS: u64 = 100;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;

impl Default for MasterConfig {
    fn default() -> Self {
        let limits = JobLimits::default();
        let policy = ResourcePolicy::default();
        Self {
            sock: default_sock(),
            sock_owner: default_sock_owner(),
            sock_group: default_sock_group(),
            sock_mode: default_sock_mode(),
            state_directory: default_state_directory(),
            policy_file: PathBuf::from("governor.json"),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            cgroup_root: crate::gov::cgroup::DEFAULT_CGROUP_ROOT.to_string(),
            cgroup_name: crate::gov::cgroup::DEFAULT_CGROUP_NAME.to_string(),
            max_runtime_ms: limits.max_runtime_ms,
            max_log_bytes: limits.max_log_bytes,
            max_output_line_bytes: limits.max_output_line_bytes,
            max_child_processes: limits.max_child_processes,
            kill_grace_ms: policy.kill_grace_ms,
            max_job_starts_per_tick: policy.max_job_starts_per_tick,
            max_job_scans_per_tick: policy.max_job_scans_per_tick,
        }
    }
}

impl MasterConfig {
    pub fn job_limits(&self) -> JobLimits {
        JobLimits {
            max_runtime_ms: self.max_runtime_ms,
            max_log_bytes: self.max_log_bytes,
            max_output_line_bytes: self.max_output_line_bytes,
            max_child_processes: self.max_child_processes,
        }
    }

    pub fn resource_policy(&self) -> ResourcePolicy {
        ResourcePolicy {
            max_processes_per_job: self.max_child_processes,
            kill_grace_ms: self.kill_grace_ms,
            max_job_starts_per_tick: self.max_job_starts_per_tick,
            max_job_scans_per_tick: self.max_job_scans_per_tick,
            ..Default::default()
        }
    }

    pub fn policy_file_path(&self) -> PathBuf {
        if self.policy_file.is_relative() {
            self.state_directory.join(&self.policy_file)
        } else {
            self.policy_file.clone()
        }
    }
}

// -------- YAML file schema (grouped only; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
    #[serde(default = "default_sock_owner")]
    owner: Option<String>,
    #[serde(default = "default_sock_group")]
    group: Option<String>,
    #[serde(default = "default_sock_mode", deserialize_with = "deserialize_sock_mode")]
    mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateConfigFile {
    #[serde(default = "default_state_directory")]
    directory: PathBuf,
    #[serde(default)]
    policy_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerConfigFile {
    #[serde(default)]
    tick_interval_ms: Option<u64>,
    #[serde(default)]
    max_runtime_ms: Option<u64>,
    #[serde(default)]
    max_log_bytes: Option<u64>,
    #[serde(default)]
    max_output_line_bytes: Option<u64>,
    #[serde(default)]
    max_child_processes: Option<i32>,
    #[serde(default)]
    kill_grace_ms: Option<u64>,
    #[serde(default)]
    max_job_starts_per_tick: Option<usize>,
    #[serde(default)]
    max_job_scans_per_tick: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CgroupConfigFile {
    #[serde(default = "default_cgroup_root")]
    root: String,
    #[serde(default = "default_cgroup_name")]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
    #[serde(default)]
    state: Option<StateConfigFile>,
    #[serde(default)]
    runner: Option<RunnerConfigFile>,
    #[serde(default)]
    cgroup: Option<CgroupConfigFile>,
}

fn default_sock() -> PathBuf {
    "/tmp/govmaster.sock".into()
}
fn default_sock_mode() -> u32 {
    0o600
}
fn default_sock_owner() -> Option<String> {
    Some("root".to_string())
}
fn default_sock_group() -> Option<String> {
    Some("root".to_string())
}
fn default_state_directory() -> PathBuf {
    "state".into()
}
fn default_cgroup_root() -> String {
    crate::gov::cgroup::DEFAULT_CGROUP_ROOT.to_string()
}
fn default_cgroup_name() -> String {
    crate::gov::cgroup::DEFAULT_CGROUP_NAME.to_string()
}

/// Socket modes are octal however YAML delivers them: `660`, `"660"` and
/// `"0o660"` all mean rw-rw----. The digits of a bare integer are re-read in
/// base 8, so there is no decimal-vs-string divergence.
fn deserialize_sock_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let digits = match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom("socket mode must be a non-negative integer"))?
            .to_string(),
        serde_yaml::Value::String(s) => s.trim().to_string(),
        _ => {
            return Err(D::Error::custom(
                "socket mode must be octal digits (e.g. 660 or \"0660\")",
            ))
        }
    };
    sock_mode_from_octal(&digits).map_err(D::Error::custom)
}

fn sock_mode_from_octal(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0o")
        .or_else(|| s.strip_prefix("0O"))
        .unwrap_or(s);
    let mode = u32::from_str_radix(digits, 8)
        .map_err(|_| format!("socket mode must be octal digits, got {s:?}"))?;
    if mode > 0o7777 {
        return Err(format!("socket mode {s:?} out of range"));
    }
    Ok(mode)
}

/// Load the master config. A missing file yields pure defaults (the daemon is
/// useful without configuration); a present-but-invalid file is an error.
pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let mut cfg = MasterConfig::default();

    let raw = match std::fs::read_to_string(config_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Resolve default relative paths against the cwd and go.
            return Ok(cfg);
        }
        Err(e) => {
            anyhow::bail!("failed to read config {}: {e}", config_path.display());
        }
    };
    let file_cfg: MasterConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    if let Some(us) = file_cfg.unix_socket {
        cfg.sock = us.path;
        cfg.sock_owner = us.owner;
        cfg.sock_group = us.group;
        cfg.sock_mode = us.mode;
    }
    if let Some(st) = file_cfg.state {
        cfg.state_directory = st.directory;
        if let Some(pf) = st.policy_file {
            cfg.policy_file = pf;
        }
    }
    if let Some(r) = file_cfg.runner {
        if let Some(v) = r.tick_interval_ms {
            anyhow::ensure!(
                v >= MIN_TICK_INTERVAL_MS,
                "runner.tick_interval_ms must be >= {MIN_TICK_INTERVAL_MS}"
            );
            cfg.tick_interval_ms = v;
        }
        if let Some(v) = r.max_runtime_ms {
            cfg.max_runtime_ms = v;
        }
        if let Some(v) = r.max_log_bytes {
            cfg.max_log_bytes = v;
        }
        if let Some(v) = r.max_output_line_bytes {
            cfg.max_output_line_bytes = v;
        }
        if let Some(v) = r.max_child_processes {
            anyhow::ensure!(v > 0, "runner.max_child_processes must be positive");
            cfg.max_child_processes = v;
        }
        if let Some(v) = r.kill_grace_ms {
            cfg.kill_grace_ms = v;
        }
        if let Some(v) = r.max_job_starts_per_tick {
            anyhow::ensure!(v > 0, "runner.max_job_starts_per_tick must be positive");
            cfg.max_job_starts_per_tick = v;
        }
        if let Some(v) = r.max_job_scans_per_tick {
            anyhow::ensure!(v > 0, "runner.max_job_scans_per_tick must be positive");
            cfg.max_job_scans_per_tick = v;
        }
    }
    if let Some(cg) = file_cfg.cgroup {
        cfg.cgroup_root = cg.root;
        cfg.cgroup_name = cg.name;
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    if cfg.sock.is_relative() {
        cfg.sock = base.join(&cfg.sock);
    }
    if cfg.state_directory.is_relative() {
        cfg.state_directory = base.join(&cfg.state_directory);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_master_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(cfg.sock, PathBuf::from("/tmp/govmaster.sock"));
        assert_eq!(cfg.max_child_processes, 64);
    }

    #[test]
    fn groups_overlay_defaults() {
        let (_dir, path) = write_config(
            "unix_socket:\n\
             \x20 path: gm.sock\n\
             \x20 mode: \"0660\"\n\
             runner:\n\
             \x20 tick_interval_ms: 250\n\
             \x20 max_child_processes: 16\n\
             state:\n\
             \x20 directory: var\n",
        );
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.sock_mode, 0o660);
        assert_eq!(cfg.tick_interval_ms, 250);
        assert_eq!(cfg.max_child_processes, 16);
        // Untouched groups keep their defaults.
        assert_eq!(cfg.kill_grace_ms, 2000);
        // Relative paths resolve against the config directory.
        assert!(cfg.sock.ends_with("gm.sock"));
        assert!(cfg.sock.is_absolute() || cfg.sock.parent().is_some());
        assert!(cfg.state_directory.ends_with("var"));
        assert_eq!(cfg.policy_file_path(), cfg.state_directory.join("governor.json"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let (_dir, path) = write_config("runner:\n\x20 tick_rate: 5\n");
        assert!(load_master_config(&path).is_err());
        let (_dir, path) = write_config("surprise: true\n");
        assert!(load_master_config(&path).is_err());
    }

    #[test]
    fn tick_interval_floor_enforced() {
        let (_dir, path) = write_config("runner:\n\x20 tick_interval_ms: 50\n");
        assert!(load_master_config(&path).is_err());
    }

    #[test]
    fn sock_mode_is_octal_in_every_form() {
        for yaml in [
            "unix_socket:\n\x20 mode: 660\n",
            "unix_socket:\n\x20 mode: \"660\"\n",
            "unix_socket:\n\x20 mode: \"0660\"\n",
            "unix_socket:\n\x20 mode: \"0o660\"\n",
        ] {
            let (_dir, path) = write_config(yaml);
            assert_eq!(load_master_config(&path).unwrap().sock_mode, 0o660, "{yaml}");
        }
    }

    #[test]
    fn sock_mode_rejects_non_octal_digits() {
        let (_dir, path) = write_config("unix_socket:\n\x20 mode: 998\n");
        assert!(load_master_config(&path).is_err());
        let (_dir, path) = write_config("unix_socket:\n\x20 mode: \"rw-\"\n");
        assert!(load_master_config(&path).is_err());
    }
}
