use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flume::unbounded;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use linkchat_backend::config::AppConfig;
use linkchat_backend::executor::LlmChatExecutor;
use linkchat_backend::llm_client::{LlmClient, Message};
use linkchat_backend::resolution::ContentResolver;
use linkchat_backend::session::ChatSession;
use linkchat_backend::store::{FileHandle, VaultStore};
use linkchat_backend::transcript::Role;

#[derive(Parser)]
#[command(name = "linkchat", about = "Run Markdown chats whose [[links]] pull in notes, media and other chats")]
struct Cli {
    /// Vault directory links are resolved against (defaults to `vault_root` from config)
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Config file to load instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved message payloads of a chat as JSON
    Resolve {
        file: PathBuf,
        /// Only consider messages with this role
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
        /// Print every message instead of the last one
        #[arg(long)]
        all: bool,
    },
    /// Send a chat to the model and append the reply to the file
    Complete { file: PathBuf },
    /// Resolve a chat while printing resolution events as JSON lines
    Tree { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    System,
    User,
    Assistant,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::System => Role::System,
            RoleArg::User => Role::User,
            RoleArg::Assistant => Role::Assistant,
        }
    }
}

struct App {
    vault: Arc<VaultStore>,
    session: ChatSession,
}

impl App {
    fn bootstrap(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => AppConfig::load_from(path)?,
            None => AppConfig::load(),
        };
        let vault_root = cli
            .vault
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.vault_root));
        let vault = Arc::new(VaultStore::open(&vault_root)?);

        tracing::info!(
            "Vault: {:?}, model: {} at {}",
            vault.root(),
            config.llm_model,
            config.llm_api_url
        );

        let llm = Arc::new(LlmClient::from_config(&config));
        let executor = Arc::new(LlmChatExecutor::new(llm.clone()));
        let resolver = ContentResolver::new(vault.clone(), executor, config.resolution.clone());
        Ok(Self {
            vault,
            session: ChatSession::new(resolver, llm),
        })
    }

    fn handle(&self, file: &Path) -> Result<FileHandle> {
        self.vault.handle_for(file)
    }
}

fn select_messages(messages: Vec<Message>, role: Option<Role>, all: bool) -> Vec<Message> {
    let mut messages: Vec<Message> = messages
        .into_iter()
        .filter(|message| role.map_or(true, |role| message.role == role))
        .collect();
    if !all && messages.len() > 1 {
        messages.drain(..messages.len() - 1);
    }
    messages
}

async fn run(cli: Cli) -> Result<()> {
    let app = App::bootstrap(&cli)?;

    match cli.command {
        Commands::Resolve { file, role, all } => {
            let handle = app.handle(&file)?;
            let messages = app.session.preview(&handle).await?;
            let selected = select_messages(messages, role.map(Role::from), all);
            println!("{}", serde_json::to_string_pretty(&selected)?);
        }
        Commands::Complete { file } => {
            let handle = app.handle(&file)?;
            let reply = app.session.complete(&handle).await?;
            println!("{}", reply);
        }
        Commands::Tree { file } => {
            let handle = app.handle(&file)?;
            let (event_tx, event_rx) = unbounded();
            let printer = tokio::spawn(async move {
                while let Ok(event) = event_rx.recv_async().await {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::warn!("Unprintable event: {}", e),
                    }
                }
            });

            let session = app.session.with_events(event_tx);
            let messages = session.preview(&handle).await;
            // Closing the last sender ends the printer.
            drop(session);
            printer.await.context("event printer panicked")?;
            tracing::info!("Resolved {} message(s)", messages?.len());
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,linkchat=debug,linkchat_backend=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run(cli))
}
