//! pushpool: send push notifications over shared, pooled gateway connections.
//!
//! # Usage
//!
//! ```text
//! pushpool send --cert app.pem --token <hex> --message "Hello"
//! pushpool stats --cert app.pem
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "pushpool",
    about = "Push notifications over pooled TLS gateway connections",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to pushpool.toml (defaults apply when the file is absent)
    #[arg(short, long, global = true, default_value = "pushpool.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one notification to one or more device tokens
    Send {
        /// Certificate identity: a PEM file inside the credentials directory
        #[arg(long)]
        cert: String,
        /// Device token as 64 hex characters (repeatable)
        #[arg(long, required = true)]
        token: Vec<String>,
        /// Alert text
        #[arg(short, long)]
        message: String,
        /// Badge number; 0 clears the badge
        #[arg(long)]
        badge: Option<u32>,
        /// Sound name
        #[arg(long, conflicts_with = "silent")]
        sound: Option<String>,
        /// Send without a sound
        #[arg(long)]
        silent: bool,
        /// Do not flag the notification as content-available
        #[arg(long)]
        no_content_available: bool,
        /// Custom top-level field as key=value; JSON values are kept typed
        #[arg(long = "field", value_parser = commands::send::parse_field)]
        fields: Vec<(String, serde_json::Value)>,
        /// Overall deadline for the send
        #[arg(long, default_value = "10s")]
        timeout: String,
    },
    /// Show pooled connection counts for a certificate
    Stats {
        #[arg(long)]
        cert: String,
    },
    /// Remove idle-expired records for a certificate
    Sweep {
        #[arg(long)]
        cert: String,
    },
    /// Forget every pooled record for a certificate
    Purge {
        #[arg(long)]
        cert: String,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("pushpool=info".parse()?);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    let config = commands::load_config(&cli.config)?;

    match cli.command {
        Commands::Send {
            cert,
            token,
            message,
            badge,
            sound,
            silent,
            no_content_available,
            fields,
            timeout,
        } => {
            let options = commands::send::SendOptions {
                cert,
                tokens: token,
                message,
                badge,
                sound,
                silent,
                content_available: !no_content_available,
                fields,
                timeout,
            };
            commands::send::send(&config, options).await
        }
        Commands::Stats { cert } => commands::pool::stats(&config, &cert).await,
        Commands::Sweep { cert } => commands::pool::sweep(&config, &cert).await,
        Commands::Purge { cert } => commands::pool::purge(&config, &cert).await,
        Commands::Config => commands::show_config(&config),
    }
}
