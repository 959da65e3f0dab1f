//! marketplace-identity CLI
//!
//! Front end for the dashboard host and for operators. Output meant for
//! scripts goes to stdout; prompts, warnings and logs go to stderr.

use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

use marketplace_identity::{
    clock::{Clock, SystemClock},
    config::{Args, Command},
    expiring::Expiry,
    FileKeyStore, FileSecretStore, IdentityError, IdentityService, KeyStore, MarketplaceClient,
    MarketplaceResult, SecretStore, SessionStatus, SigningSession, UnlockDuration,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        eprintln!("error: {e}");
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let fatal = e
                .downcast_ref::<IdentityError>()
                .is_some_and(|e| !e.is_recoverable());
            ExitCode::from(if fatal { 2 } else { 1 })
        }
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("marketplace_identity={},warn", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

struct App {
    args: Args,
    identity: IdentityService,
    session: Arc<SigningSession>,
    client: MarketplaceClient,
    clock: Arc<dyn Clock>,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let data_dir = args.resolved_data_dir()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let key_store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(&data_dir)?);
    let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(args.vault_path(&data_dir)));
    debug!(data_dir = %data_dir.display(), "Opened identity store");

    let session = Arc::new(
        SigningSession::open(key_store.clone(), secrets.clone(), clock.clone()).await?,
    );
    let identity = IdentityService::new(key_store.clone(), session.clone(), clock.clone());
    let client = MarketplaceClient::new(
        args.marketplace_config(),
        key_store,
        session.clone(),
        secrets,
        clock.clone(),
    )?;

    let app = App {
        args,
        identity,
        session,
        client,
        clock,
    };
    app.dispatch().await
}

impl App {
    async fn dispatch(&self) -> anyhow::Result<()> {
        match self.args.command.clone() {
            Command::Init { force } => self.init(force).await,
            Command::Status => self.status().await,
            Command::Unlock { duration } => self.unlock(duration).await,
            Command::Lock => {
                self.session.lock().await?;
                println!("Signing session locked");
                Ok(())
            }
            Command::Duration { duration } => {
                let status = self.session.set_unlock_duration(duration).await?;
                if status.is_unlocked() {
                    warn_if_durable(duration);
                }
                println!("Unlock duration: {duration}");
                Ok(())
            }
            Command::Export { output } => {
                let key_file = self.identity.export_key_file()?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, key_file)
                            .with_context(|| format!("writing {}", path.display()))?;
                        println!("Key file written to {}", path.display());
                    }
                    None => println!("{key_file}"),
                }
                Ok(())
            }
            Command::Import { path } => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let identity = self.identity.import_key_file(&contents).await?;
                println!("Imported identity {}", identity.public_key_hash);
                println!("Signing session locked; unlock with the key file's password");
                Ok(())
            }
            Command::Register => {
                self.ensure_unlocked().await?;
                report(self.client.register().await)
            }
            Command::SyncProfile { profile } => {
                let profile = match profile {
                    Some(raw) => parse_object(&raw)?,
                    None => json!(self.client.config().instance),
                };
                self.ensure_unlocked().await?;
                report(self.client.sync_profile(profile).await)
            }
            Command::Post { path, body } => {
                let body = parse_object(&body)?;
                self.ensure_unlocked().await?;
                report(self.client.signed_marketplace_post(&path, body).await)
            }
            Command::Sign { body } => {
                let body = parse_object(&body)?;
                self.ensure_unlocked().await?;
                let signed = self.client.sign_request(body).await?;
                println!("{}", serde_json::to_string_pretty(&signed)?);
                Ok(())
            }
            Command::SyncVault => {
                self.ensure_unlocked().await?;
                self.client.persist_key_to_vault(None).await?;
                println!("Signing key exported to vault");
                Ok(())
            }
        }
    }

    async fn init(&self, force: bool) -> anyhow::Result<()> {
        if !force && self.identity.has_instance_key()? {
            return Err(IdentityError::IdentityExists.into());
        }

        let password = self.new_password()?;
        let identity = if force {
            self.identity.regenerate_identity(&password).await?
        } else {
            self.identity.create_identity(&password).await?
        };

        println!("Instance ID: {}", identity.public_key_hash);
        println!("Public key:  {}", identity.public_key);
        Ok(())
    }

    async fn status(&self) -> anyhow::Result<()> {
        match self.identity.public_identity()? {
            Some(identity) => {
                println!("Instance ID: {}", identity.public_key_hash);
                println!("Public key:  {}", identity.public_key);
                println!("Created:     {}", identity.created_at.to_rfc3339());
            }
            None => println!("No identity (run `init`)"),
        }

        let duration = self.session.unlock_duration().await;
        match self.session.status().await {
            SessionStatus::Locked => println!("Session:     locked"),
            SessionStatus::Unlocked { expires } => {
                println!("Session:     unlocked ({})", describe_expiry(expires, self.clock.as_ref()));
            }
        }
        println!("Duration:    {duration}");
        Ok(())
    }

    /// Unlock, switching to `requested` once the password is accepted.
    async fn unlock(&self, requested: Option<UnlockDuration>) -> anyhow::Result<()> {
        let duration = match requested {
            Some(duration) => duration,
            None => self.session.unlock_duration().await,
        };
        warn_if_durable(duration);

        let password = self.password("Password: ")?;
        let status = self.client.unlock_and_sync_with(&password, requested).await?;

        if let SessionStatus::Unlocked { expires } = status {
            println!("Unlocked ({})", describe_expiry(expires, self.clock.as_ref()));
        }
        if !duration.is_durable() {
            println!("Unlock lasts for this process only; use --duration to keep it");
        }
        Ok(())
    }

    /// Unlock for this command if needed, prompting for the password.
    async fn ensure_unlocked(&self) -> anyhow::Result<()> {
        if self.session.is_unlocked().await {
            return Ok(());
        }
        if !self.identity.has_instance_key()? {
            return Err(IdentityError::NoInstanceKey.into());
        }

        warn_if_durable(self.session.unlock_duration().await);
        let password = self.password("Password: ")?;
        self.client.unlock_and_sync(&password).await?;
        Ok(())
    }

    fn password(&self, prompt: &str) -> anyhow::Result<Zeroizing<String>> {
        if let Some(ref password) = self.args.password {
            return Ok(Zeroizing::new(password.clone()));
        }
        read_line(prompt)
    }

    fn new_password(&self) -> anyhow::Result<Zeroizing<String>> {
        if let Some(ref password) = self.args.password {
            return Ok(Zeroizing::new(password.clone()));
        }

        let password = read_line("New password: ")?;
        if password.is_empty() {
            anyhow::bail!("password must not be empty");
        }
        let confirm = read_line("Confirm password: ")?;
        if *password != *confirm {
            anyhow::bail!("passwords do not match");
        }
        Ok(password)
    }
}

fn read_line(prompt: &str) -> anyhow::Result<Zeroizing<String>> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password from stdin")?;

    let trimmed_len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed_len);
    Ok(line)
}

fn warn_if_durable(duration: UnlockDuration) {
    if duration.is_durable() {
        eprintln!(
            "warning: unlock duration '{duration}' keeps the decrypted signing key in the local \
             vault until it expires; anyone who can read that vault can sign as this instance \
             (run `lock` to discard it)"
        );
    }
}

fn describe_expiry(expires: Expiry, clock: &dyn Clock) -> String {
    match expires {
        Expiry::Never => "no expiry".to_string(),
        Expiry::At(at) => {
            let remaining = expires.remaining(clock.now()).unwrap_or_else(chrono::Duration::zero);
            format!(
                "expires {} - {}h {}m left",
                at.to_rfc3339(),
                remaining.num_hours(),
                remaining.num_minutes() % 60
            )
        }
    }
}

fn parse_object(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw).context("body is not valid JSON")?;
    if !value.is_object() {
        return Err(IdentityError::InvalidRequest("body must be a JSON object".into()).into());
    }
    Ok(value)
}

fn report(result: MarketplaceResult) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.success {
        Ok(())
    } else {
        anyhow::bail!(result.error.unwrap_or_else(|| "marketplace request failed".into()))
    }
}
