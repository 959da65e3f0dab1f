//! Configuration for the marketplace-identity CLI
//!
//! CLI arguments and environment variable handling using clap. Every
//! option can also come from the environment (or a `.env` file).

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::client::{InstanceMetadata, MarketplaceConfig};
use crate::session::UnlockDuration;
use crate::types::{IdentityError, Result};

/// Directory name under the platform data dir
pub const DATA_DIR_NAME: &str = "marketplace-identity";

/// File name of the local vault stand-in inside the data dir
pub const VAULT_FILE_NAME: &str = "vault.json";

/// marketplace-identity - instance keys and signing sessions
#[derive(Parser, Debug, Clone)]
#[command(name = "marketplace-identity")]
#[command(about = "Instance identity keys and signing sessions for marketplace requests")]
#[command(version)]
pub struct Args {
    /// Directory holding the key bundle, session record and vault
    /// (defaults to the platform data dir)
    #[arg(long, env = "IDENTITY_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Marketplace base URL
    #[arg(
        long,
        env = "MARKETPLACE_URL",
        default_value = "http://localhost:3000",
        global = true
    )]
    pub marketplace_url: String,

    /// Instance name reported on registration
    #[arg(long, env = "INSTANCE_NAME", default_value = "ai-company", global = true)]
    pub instance_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false", global = true)]
    pub log_json: bool,

    /// Marketplace request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000", global = true)]
    pub request_timeout_ms: u64,

    /// Identity password (read from stdin when not set)
    #[arg(long, env = "IDENTITY_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Generate the instance identity
    Init {
        /// Replace an existing identity (the old key is lost)
        #[arg(long)]
        force: bool,
    },

    /// Show identity and session state
    Status,

    /// Unlock the signing session and export the key to the vault
    Unlock {
        /// Set the unlock duration first
        #[arg(long)]
        duration: Option<UnlockDuration>,
    },

    /// Lock the signing session now
    Lock,

    /// Set the unlock duration (session, day, week, month, forever)
    Duration { duration: UnlockDuration },

    /// Export the encrypted key file
    Export {
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Replace the identity with an exported key file
    Import { path: PathBuf },

    /// Register this instance on the marketplace
    Register,

    /// Push the instance profile to the marketplace
    SyncProfile {
        /// Profile JSON object (defaults to the instance metadata)
        profile: Option<String>,
    },

    /// Send a signed POST with a JSON object body
    Post { path: String, body: String },

    /// Print a signed copy of a JSON object without sending it
    Sign { body: String },

    /// Export the unlocked signing key to the vault
    SyncVault,
}

impl Args {
    /// Data directory, falling back to `<platform data dir>/marketplace-identity`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|dir| dir.join(DATA_DIR_NAME))
            .ok_or_else(|| {
                IdentityError::Config(
                    "no platform data directory; set IDENTITY_DATA_DIR".to_string(),
                )
            })
    }

    pub fn vault_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(VAULT_FILE_NAME)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn marketplace_config(&self) -> MarketplaceConfig {
        MarketplaceConfig {
            base_url: self.marketplace_url.clone(),
            request_timeout: self.request_timeout(),
            instance: InstanceMetadata::for_host(self.instance_name.clone()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.marketplace_url.starts_with("http://") && !self.marketplace_url.starts_with("https://") {
            return Err("MARKETPLACE_URL must start with http:// or https://".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.instance_name.trim().is_empty() {
            return Err("INSTANCE_NAME must not be empty".to_string());
        }

        Ok(())
    }
}
