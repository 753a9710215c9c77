use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::store::{
    BackoffPolicy, ExponentialBackoff, FixedBackoff, FlockLockManager, InMemoryLockManager,
    LockManager, Store, StoreConfig, StoreError,
};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    Flock,
    Memory,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ipfeed",
    about = "IP allow list editor with versioned rollback",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the HTTP API (default).
    Run,

    /// Print the current allow list.
    List,

    /// Append an address to the allow list.
    Add(IpArgs),

    /// Remove an address from the allow list.
    Remove(IpArgs),

    /// List saved versions, most recent first.
    Versions,

    /// Restore the allow list from a saved version.
    Rollback(RollbackArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IpArgs {
    #[arg(value_name = "IP")]
    pub ip: String,
}

#[derive(Args, Debug, Clone)]
pub struct RollbackArgs {
    #[arg(value_name = "VERSION")]
    pub version: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "IPFEED_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:5000"
    )]
    pub bind: SocketAddr,

    #[arg(
        long = "ip-file",
        global = true,
        env = "IPFEED_IP_FILE",
        value_name = "PATH",
        default_value = "./allowed_ips.txt"
    )]
    pub ip_file: PathBuf,

    #[arg(
        long = "versions-dir",
        global = true,
        env = "IPFEED_VERSIONS_DIR",
        value_name = "PATH",
        default_value = "./versions"
    )]
    pub versions_dir: PathBuf,

    #[arg(
        long = "lock-backend",
        global = true,
        env = "IPFEED_LOCK_BACKEND",
        value_name = "BACKEND",
        default_value = "flock",
        value_enum
    )]
    pub lock_backend: LockBackend,

    #[arg(
        long = "retry-attempts",
        global = true,
        env = "IPFEED_RETRY_ATTEMPTS",
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..=50)
    )]
    pub retry_attempts: u32,

    #[arg(
        long = "retry-delay-ms",
        global = true,
        env = "IPFEED_RETRY_DELAY_MS",
        value_name = "MS",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..=60000)
    )]
    pub retry_delay_ms: u64,

    #[arg(
        long = "retry-strategy",
        global = true,
        env = "IPFEED_RETRY_STRATEGY",
        value_name = "STRATEGY",
        default_value = "fixed",
        value_enum
    )]
    pub retry_strategy: RetryStrategy,
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.ip_file.clone(), self.versions_dir.clone())
    }

    pub fn backoff(&self) -> Arc<dyn BackoffPolicy> {
        let delay = Duration::from_millis(self.retry_delay_ms);
        match self.retry_strategy {
            RetryStrategy::Fixed => Arc::new(FixedBackoff::new(self.retry_attempts, delay)),
            RetryStrategy::Exponential => Arc::new(
                ExponentialBackoff::new(self.retry_attempts, delay, delay.saturating_mul(32))
                    .with_jitter(4),
            ),
        }
    }

    pub fn lock_manager(&self) -> Arc<dyn LockManager> {
        match self.lock_backend {
            LockBackend::Flock => Arc::new(FlockLockManager),
            LockBackend::Memory => Arc::new(InMemoryLockManager::new()),
        }
    }

    pub fn open_store(&self) -> Result<Store, StoreError> {
        Store::open_with(self.store_config(), self.lock_manager(), self.backoff())
    }
}
