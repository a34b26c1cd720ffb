use serde::Deserialize;
use std::path::Path;

/// Garbage-collection strategy selected for every fresh interpreter state.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GcMode {
    #[default]
    Generational,
    Incremental,
}

/// How the execution status byte is packed into the 4-byte response word.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StatusEncoding {
    /// Status in bits 0..8.
    #[default]
    LowByte,
    /// Status in bits 8..16, the layout `waitpid` uses for exit codes.
    WaitStatus,
}

impl StatusEncoding {
    pub fn encode(self, status: u8) -> u32 {
        match self {
            StatusEncoding::LowByte => u32::from(status),
            StatusEncoding::WaitStatus => u32::from(status) << 8,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub gc_mode: GcMode,
    #[serde(default = "default_chunk_name")]
    pub chunk_name: String,
    #[serde(default = "default_interrupt_interval")]
    pub interrupt_interval: u32,
    #[serde(default)]
    pub ignore_env: bool,
    #[serde(default = "default_text_only")]
    pub text_only: bool,
}

fn default_chunk_name() -> String {
    "chunk".to_string()
}

pub fn default_interrupt_interval() -> u32 {
    1000
}

fn default_text_only() -> bool {
    true
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            gc_mode: GcMode::default(),
            chunk_name: default_chunk_name(),
            interrupt_interval: default_interrupt_interval(),
            ignore_env: false,
            text_only: default_text_only(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    #[serde(default)]
    pub status_encoding: StatusEncoding,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub stats_interval: u64,
}

fn default_level() -> String {
    "warn".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            stats_interval: 0,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl HarnessConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: HarnessConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
