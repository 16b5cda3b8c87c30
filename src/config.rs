use crate::upstream::UpstreamTimeouts;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the vault master key. Never passed on argv.
pub const MASTER_KEY_ENV: &str = "STORAGE_MASTER_KEY";

/// Wallet Multiplexer Daemon
#[derive(Parser, Debug, Clone)]
#[command(version, author, about)]
pub struct Config {
    /// Location of the ledger database and data files
    #[clap(default_value = ".", long)]
    pub data_dir: String,
    /// Ledger database file name inside the data dir
    #[clap(default_value = "multiplexer.db", long)]
    pub db_file: String,

    /// Relay endpoint advertised to newly created sub-wallets (repeatable)
    #[clap(long = "relay")]
    pub relays: Vec<String>,
    /// Connect URI for the upstream wallet client
    #[clap(long)]
    pub upstream_uri: Option<String>,

    /// Seconds between expiry sweeps
    #[clap(default_value_t = 60, long)]
    pub sweep_interval_secs: u64,

    /// Timeout for upstream info calls, in seconds
    #[clap(default_value_t = 15, long)]
    pub info_timeout_secs: u64,
    /// Timeout for upstream invoice create/lookup calls, in seconds
    #[clap(default_value_t = 20, long)]
    pub invoice_timeout_secs: u64,
    /// Timeout for upstream pay calls, in seconds
    #[clap(default_value_t = 60, long)]
    pub pay_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: ".".to_string(),
            db_file: "multiplexer.db".to_string(),
            relays: Vec::new(),
            upstream_uri: None,
            sweep_interval_secs: 60,
            info_timeout_secs: 15,
            invoice_timeout_secs: 20,
            pay_timeout_secs: 60,
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.db_file)
    }

    pub fn master_key(&self) -> anyhow::Result<String> {
        std::env::var(MASTER_KEY_ENV)
            .map_err(|_| anyhow::anyhow!("{MASTER_KEY_ENV} must be set"))
    }

    pub fn upstream_timeouts(&self) -> UpstreamTimeouts {
        UpstreamTimeouts {
            info: Duration::from_secs(self.info_timeout_secs),
            invoice: Duration::from_secs(self.invoice_timeout_secs),
            pay: Duration::from_secs(self.pay_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
