//! Daemon configuration: the set of options the core consumes, loaded from a
//! JSON file with auto-applied defaults for everything but the instance list.

use crate::instance::{ModuleKind, MAX_INSTANCE_NAME};
use crate::selection::{RuleId, Strategy};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/refsyncd/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sync_instances: Vec<InstanceConfig>,

    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub crny: CrnyConfig,

    #[serde(default)]
    pub clockfeed: FeedConfig,

    #[serde(default)]
    pub servo: ServoConfig,

    /// 2-byte pad inserted into the MAC when forming clock identities.
    #[serde(default = "default_clock_id_suffix")]
    pub clock_id_suffix: [u8; 2],

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub kind: ModuleKind,
    pub name: String,
    #[serde(default)]
    pub user_priority: u32,
    /// Local accuracy estimate in seconds; unknown if omitted.
    pub accuracy: Option<f64>,
    /// Upstream server for `ntp` instances.
    pub ntp_server: Option<String>,
    /// Per-instance poll interval in seconds.
    pub poll_interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "RuleId::default_order")]
    pub rules: Vec<RuleId>,
    #[serde(default = "default_holdoff_secs")]
    pub holdoff_secs: u64,
    pub initial_instance: Option<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            strategy: Strategy::Automatic,
            rules: RuleId::default_order(),
            holdoff_secs: default_holdoff_secs(),
            initial_instance: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrnyConfig {
    #[serde(default = "default_chrony_socket")]
    pub socket_path: PathBuf,
    /// Helper script for enabling/disabling chrony's clock control. Without
    /// one the adapter can only observe.
    pub control_script: Option<PathBuf>,
    #[serde(default = "default_crny_poll_secs")]
    pub poll_interval_secs: u64,
    /// Minimum interval between successive non-restore helper invocations.
    #[serde(default)]
    pub min_script_interval_secs: u64,
}

impl Default for CrnyConfig {
    fn default() -> Self {
        CrnyConfig {
            socket_path: default_chrony_socket(),
            control_script: None,
            poll_interval_secs: default_crny_poll_secs(),
            min_script_interval_secs: 0,
        }
    }
}

impl CrnyConfig {
    /// The adapter never polls faster than once per second.
    pub fn effective_poll_secs(&self) -> u64 {
        self.poll_interval_secs.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Base sampling period is `2^base_poll_log2` seconds.
    #[serde(default)]
    pub base_poll_log2: i32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig { base_poll_log2: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig { kp: 0.3, ki: 0.1 }
    }
}

fn default_clock_id_suffix() -> [u8; 2] {
    [0xff, 0xfe]
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/refsyncd")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/var/run/refsyncd.sock")
}

fn default_holdoff_secs() -> u64 {
    10
}

fn default_chrony_socket() -> PathBuf {
    PathBuf::from("/var/run/chrony/chronyd.sock")
}

fn default_crny_poll_secs() -> u64 {
    1
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_instances.is_empty() {
            bail!("no sync instances configured");
        }
        let mut names = HashSet::new();
        for inst in &self.sync_instances {
            if inst.name.is_empty() || inst.name.len() > MAX_INSTANCE_NAME {
                bail!(
                    "instance name '{}' must be 1..={} characters",
                    inst.name,
                    MAX_INSTANCE_NAME
                );
            }
            if !names.insert(inst.name.as_str()) {
                bail!("duplicate instance name '{}'", inst.name);
            }
            if inst.kind == ModuleKind::Ntp && inst.ntp_server.is_none() {
                bail!("ntp instance '{}' needs an ntp_server", inst.name);
            }
        }
        if let Some(initial) = &self.selection.initial_instance {
            if !names.contains(initial.as_str()) {
                bail!("initial_instance '{}' is not a configured instance", initial);
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
