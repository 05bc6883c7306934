use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PipeSettings {
    /// FIFO carrying frames from the fuzzer to the driver.
    #[serde(default = "default_inbound_pipe")]
    pub inbound: PathBuf,
    /// FIFO carrying frames from the driver to the fuzzer.
    #[serde(default = "default_outbound_pipe")]
    pub outbound: PathBuf,
}

fn default_inbound_pipe() -> PathBuf {
    PathBuf::from("./pipe/to_driver.fifo")
}

fn default_outbound_pipe() -> PathBuf {
    PathBuf::from("./pipe/to_fuzzer.fifo")
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            inbound: default_inbound_pipe(),
            outbound: default_outbound_pipe(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    /// Per-operation bound on each attribute write and read.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Follow every write with a read of the same attribute.
    #[serde(default = "default_read_after_write")]
    pub read_after_write: bool,
    /// Ask the peer to acknowledge writes.
    #[serde(default = "default_confirm_writes")]
    pub confirm_writes: bool,
    /// Sleep between advertisement checks while scanning.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_op_timeout_ms() -> u64 {
    1000
}
fn default_read_after_write() -> bool {
    true
}
fn default_confirm_writes() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            op_timeout_ms: default_op_timeout_ms(),
            read_after_write: default_read_after_write(),
            confirm_writes: default_confirm_writes(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SessionSettings {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    pub pipes: PipeSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl TetherConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: TetherConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
