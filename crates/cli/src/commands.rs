//! CLI commands

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};
use turnstile_client::{AuthClient, ClientConfig, LoginRequest, RegisterRequest, SessionEvent};

use crate::config;

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in and store the session
    Login {
        /// Account email
        #[arg(long, env = "TURNSTILE_EMAIL")]
        email: String,

        /// Account password
        #[arg(long, env = "TURNSTILE_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Create an account
    Register {
        /// Account email
        #[arg(long, env = "TURNSTILE_EMAIL")]
        email: String,

        /// Account password
        #[arg(long, env = "TURNSTILE_PASSWORD", hide_env_values = true)]
        password: String,

        /// Additional profile field, as key=value
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Show the signed-in user, restoring the session if needed
    Whoami,

    /// Ask the server who is signed in
    Me,

    /// GET an API path and print the JSON response
    Get {
        /// Path relative to the base URL, e.g. /projects
        path: String,
    },

    /// Configuration files
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Generate a default configuration file
    Init {
        /// Output file path (defaults to TURNSTILE_STATE_DIR/config.json)
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Show,
}

/// Settings shared by every command
pub struct Settings {
    pub data_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub base_url: Option<String>,
}

impl Settings {
    fn client_config(&self) -> Result<ClientConfig> {
        config::load_client_config(
            self.config_path.as_deref(),
            &self.data_dir,
            self.base_url.clone(),
        )
    }

    fn connect(&self) -> Result<AuthClient> {
        Ok(AuthClient::new(self.client_config()?)?)
    }
}

impl Commands {
    pub async fn execute(self, ctx: Settings) -> Result<()> {
        if let Self::Config { command } = self {
            return command.execute(&ctx);
        }

        let client = ctx.connect()?;
        let mut events = client.subscribe();
        let outcome = self.run(&client).await;

        for notice in session_notices(&mut events) {
            warn!("{notice}");
        }
        outcome
    }

    async fn run(self, client: &AuthClient) -> Result<()> {
        match self {
            Self::Login { email, password } => {
                let session = client
                    .login(&LoginRequest::new(email, password))
                    .await
                    .context("Login failed")?;
                println!("Signed in as {} ({})", session.email, session.id);
                Ok(())
            }
            Self::Register {
                email,
                password,
                fields,
            } => {
                let request = fields
                    .into_iter()
                    .fold(RegisterRequest::new(email, password), |request, (key, value)| {
                        request.field(key, value)
                    });
                match client.register(&request).await.context("Registration failed")? {
                    Some(session) => println!("Registered and signed in as {}", session.email),
                    None => println!("Registered; sign in with `turnstile login`"),
                }
                Ok(())
            }
            Self::Logout => {
                client.logout().await;
                println!("Signed out");
                Ok(())
            }
            Self::Whoami => {
                let Some(claims) = client.get_current_user().await else {
                    bail!("Not signed in");
                };
                println!("{}", serde_json::to_string_pretty(&claims)?);
                Ok(())
            }
            Self::Me => {
                let me = client.me().await?;
                println!("{}", serde_json::to_string_pretty(&me)?);
                Ok(())
            }
            Self::Get { path } => {
                if !path.starts_with('/') {
                    bail!("Path must start with '/', got {path:?}");
                }
                let body: Value = client.get(&path).await?;
                println!("{}", serde_json::to_string_pretty(&body)?);
                Ok(())
            }
            Self::Config { .. } => Ok(()),
        }
    }
}

impl ConfigCommands {
    pub fn execute(self, ctx: &Settings) -> Result<()> {
        match self {
            Self::Init { output } => {
                let config_path = output.unwrap_or_else(|| config::default_config_path(&ctx.data_dir));
                if config_path.exists() {
                    bail!("{} already exists", config_path.display());
                }
                create_parent(&config_path)?;

                config::generate_default_config(&config_path)?;
                println!("Generated configuration at: {}", config_path.display());
                Ok(())
            }
            Self::Show => {
                let config = ctx.client_config()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Drain the events a command produced, keeping what the user needs to see
fn session_notices(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<String> {
    let mut notices = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Ended { reason }) => notices.push(format!(
                "Session ended: {reason}. Run `turnstile login` to sign in again"
            )),
            Ok(event) => info!(?event, "Session event"),
            Err(TryRecvError::Lagged(missed)) => warn!(missed, "Missed session events"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    notices
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}
