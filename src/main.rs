use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[derive(Parser)]
#[command(name = "vaultchat")]
#[command(author, version, about = "Vaultchat - encrypted multi-session chat client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat in a new or existing session
    Chat {
        /// Session to resume (a new one is created when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Prompt preset to apply (general, code_review, teacher, translator, writer)
        #[arg(short, long)]
        preset: Option<String>,
    },

    /// List stored sessions
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create an empty session and print its id
    New {
        /// Session title
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Delete a session and its stored blob
    Delete {
        /// Session id
        id: String,
    },

    /// Export a session transcript as Markdown
    Export {
        /// Session id
        id: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a new base64 encryption key
    Keygen,

    /// Encrypt an API credential read from stdin with the configured key
    EncryptCredential,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "vaultchat=debug"
    } else {
        "vaultchat=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Chat { session, preset } => {
            let config = cli::load_config(config_path)?;
            cli::run_chat(&config, session, preset).await
        }
        Commands::List { json } => cli::run_list(&cli::load_config(config_path)?, json),
        Commands::New { title } => cli::run_new(&cli::load_config(config_path)?, title.as_deref()),
        Commands::Delete { id } => cli::run_delete(&cli::load_config(config_path)?, &id).await,
        Commands::Export { id, output } => {
            cli::run_export(&cli::load_config(config_path)?, &id, output)
        }
        Commands::Keygen => cli::run_keygen(),
        Commands::EncryptCredential => cli::run_encrypt_credential(),
    }
}
