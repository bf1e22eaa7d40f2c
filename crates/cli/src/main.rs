//! fastrag CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP gateway
//! - `ask`     — Answer one message in a conversation
//! - `notes`   — List, add and delete notes
//! - `history` — Print a conversation's turns
//! - `config`  — Show, validate or locate the configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "fastrag",
    about = "fastrag — retrieval-augmented conversations over your notes",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask one question in a conversation
    Ask {
        /// Conversation to continue (a new one is started when omitted)
        #[arg(short, long)]
        conversation: Option<String>,

        /// Owner of the conversation and of the notes searched
        #[arg(short, long, env = "FASTRAG_OWNER")]
        owner: String,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        turn: commands::ask::TurnFlags,

        /// The message to answer
        message: String,
    },

    /// Manage notes
    Notes {
        #[command(subcommand)]
        action: NotesAction,
    },

    /// Print the turns of a conversation
    History {
        /// Conversation ID
        conversation: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum NotesAction {
    /// List an owner's notes
    List {
        #[arg(short, long, env = "FASTRAG_OWNER")]
        owner: String,
    },

    /// Add a note
    Add {
        #[arg(short, long, env = "FASTRAG_OWNER")]
        owner: String,

        #[arg(short, long, default_value = "")]
        title: String,

        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Link the note points at
        #[arg(long)]
        url: Option<String>,

        /// Free-form remarks kept with the note
        #[arg(long)]
        comments: Option<String>,

        body: String,
    },

    /// Delete a note
    Delete { note_id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Load and validate the configuration
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Ask {
            conversation,
            owner,
            json,
            turn,
            message,
        } => commands::ask::run(conversation, &owner, &message, &turn, json).await?,
        Commands::Notes { action } => match action {
            NotesAction::List { owner } => commands::notes::list(&owner).await?,
            NotesAction::Add {
                owner,
                title,
                tags,
                url,
                comments,
                body,
            } => commands::notes::add(&owner, &title, &body, tags, url, comments).await?,
            NotesAction::Delete { note_id } => commands::notes::delete(&note_id).await?,
        },
        Commands::History { conversation } => commands::ask::history(&conversation).await?,
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
