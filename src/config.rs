pub use config::Config;
pub use once_cell::sync::OnceCell;

use bitcoin::network::constants::Network;

use crate::types::SyncError;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<(), SyncError> {
    let config = Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .map_err(|e| SyncError::Config(format!("failed to load {}: {}", path, e)))?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| SyncError::Config("config already set".to_string()))?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Parse the configured network name into address-decoding rules.
pub fn network_from_config(config: &Config) -> Result<Network, SyncError> {
    let name = config
        .get_string("network")
        .map_err(|e| SyncError::Config(format!("missing network: {}", e)))?;
    parse_network(&name)
}

pub fn parse_network(name: &str) -> Result<Network, SyncError> {
    match name {
        "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        other => Err(SyncError::Config(format!("unknown network: {}", other))),
    }
}

/// Node RPC endpoint settings.
pub fn rpc_settings(config: &Config) -> Result<(String, Option<String>, Option<String>), SyncError> {
    let url = config
        .get_string("rpc.url")
        .map_err(|e| SyncError::Config(format!("missing rpc.url: {}", e)))?;
    let user = config.get_string("rpc.user").ok();
    let pass = config.get_string("rpc.pass").ok();
    Ok((url, user, pass))
}

pub fn poll_interval_secs(config: &Config) -> u64 {
    config.get_int("sync.poll_interval_secs").unwrap_or(5) as u64
}
