use serde::{Deserialize, Serialize};

#[cfg(not(test))]
use std::path::Path;
use std::path::PathBuf;

#[cfg(not(test))]
fn try_load_config(config_path: impl AsRef<Path>) -> Result<Config, Box<dyn std::error::Error>> {
    use std::{fs::File, io::Read};

    let mut file = File::open(config_path.as_ref())?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    let config = toml::from_str(buf.as_str())?;
    log::info!("load config from {:?}", config_path.as_ref());
    Ok(config)
}

#[cfg(not(test))]
lazy_static::lazy_static! {
    pub static ref CONFIG: Config={
        let path=PathBuf::from(
            std::env::var("CONFIG_PATH").unwrap_or("config.toml".to_string()));
        try_load_config(path).unwrap_or_default().check()
    };
}

#[cfg(test)]
lazy_static::lazy_static! {
    pub static ref CONFIG: Config=Config::default();
}

fn default_mem_limit_per_entry() -> u64 {
    512 * 1024 * 1024
}

fn default_mem_budget_total() -> u64 {
    1024 * 1024 * 1024
}

fn default_log() -> u8 {
    2
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// entries at least this large always go to the disk tier
    #[serde(default = "default_mem_limit_per_entry")]
    pub mem_limit_per_entry: u64,
    /// upper bound on bytes held in small-file buffers across all handles
    #[serde(default = "default_mem_budget_total")]
    pub mem_budget_total: u64,
    /// parent of the session temp directory, `std::env::temp_dir()` if unset
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    #[serde(default = "default_log")]
    pub log: u8,
}

impl Config {
    #[cfg(not(test))]
    fn check(mut self) -> Self {
        if self.mem_limit_per_entry > self.mem_budget_total {
            log::warn!("mem_limit_per_entry exceeds mem_budget_total, clamping");
            self.mem_limit_per_entry = self.mem_budget_total;
        }
        self
    }
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_limit_per_entry: default_mem_limit_per_entry(),
            mem_budget_total: default_mem_budget_total(),
            temp_root: None,
            log: default_log(),
        }
    }
}
