/// Global configuration from config.toml.

use config::Config;
use once_cell::sync::OnceCell;

use crate::error::{IndexerError, Result};

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<()> {
    let config = Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .map_err(|e| IndexerError::chain(format!("loading config: {e}")))?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| IndexerError::chain("config already initialized"))
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

pub fn db_path(config: &Config) -> Result<String> {
    config
        .get_string("paths.db_path")
        .map_err(|e| IndexerError::chain(format!("missing paths.db_path in config: {e}")))
}

pub fn daemon_url(config: &Config) -> Result<String> {
    config
        .get_string("daemon.url")
        .map_err(|e| IndexerError::chain(format!("missing daemon.url in config: {e}")))
}

pub fn daemon_auth(config: &Config) -> (Option<String>, Option<String>) {
    (
        config.get_string("daemon.user").ok(),
        config.get_string("daemon.pass").ok(),
    )
}

pub fn reorg_limit(config: &Config) -> u32 {
    config
        .get_int("chain.reorg_limit")
        .map(|v| v as u32)
        .unwrap_or(crate::coin::REORG_LIMIT)
}

pub fn mempool_refresh_secs(config: &Config) -> f64 {
    config
        .get_float("mempool.refresh_secs")
        .unwrap_or(crate::mempool::DEFAULT_REFRESH_SECS)
}

pub fn prefetch_min_cache_size(config: &Config) -> usize {
    config
        .get_int("prefetch.min_cache_size")
        .map(|v| v as usize)
        .unwrap_or(crate::prefetch::DEFAULT_MIN_CACHE_SIZE)
}

pub fn prefetch_polling_delay_secs(config: &Config) -> u64 {
    config
        .get_int("prefetch.polling_delay")
        .map(|v| v as u64)
        .unwrap_or(crate::prefetch::DEFAULT_POLLING_DELAY.as_secs())
}
