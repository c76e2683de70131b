//! Emulator tunables, loaded from a TOML file when present.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How many emulated threads may run concurrently. Ready threads past
    /// this window stay suspended until a slot opens.
    pub ppu_threads: usize,

    /// Upper bound on any wait timeout, in guest microseconds.
    pub max_timeout_us: u64,

    /// Whether process-shared objects must carry a non-zero IPC key.
    pub ipc_key_required: bool,

    /// Fast-path CAS retries before a lightweight mutex commits to the
    /// kernel slow path.
    pub spin_iters: u32,

    /// Size of the kernel object table.
    pub max_objects: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ppu_threads: 8,
            max_timeout_us: 86_400_000_000, // 24h
            ipc_key_required: true,
            spin_iters: 10,
            max_objects: 8192,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err)
    }
}

pub fn load(path: &std::path::Path) -> Result<Config, ConfigError> {
    let bytes = std::fs::read_to_string(path)?;
    let config = toml::from_str(&bytes)?;
    Ok(config)
}
