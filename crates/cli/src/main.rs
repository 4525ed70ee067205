//! Terminal front end for the chat turn pipeline.
//!
//! ```bash
//! chatline send "what is in this picture?" --attach cat.png
//! chatline send --conversation <ID> "and the background?"
//! chatline retry --conversation <ID> <MESSAGE_ID> --model other/model
//! chatline history --conversation <ID>
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chatline::media::{FALLBACK_MEDIA_TYPE, classify_media_type};
use chatline::{
    ChatHooks, ChatSettings, HydrationCache, OrchestratorConfig, SendError, SendOrchestrator,
    SendRequest, SettingsStore, TurnOutcome,
};
use chatline_llm::{ProviderError, StreamEvent, create_transport};
use chatline_storage::{
    ContentHash, ContentStore, ConversationId, InMemoryStorage, MessageId, MessageRecord,
    MessageStore, NewContent, SqliteStorage, Storage, StorageError,
};
use clap::{Parser, Subcommand};
use snafu::{ResultExt, Snafu};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatline", about = "Streaming chat turns from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file override
    #[arg(long, global = true, env = "CHATLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Keep everything in memory for this run
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and stream the reply
    Send {
        /// Continue an existing conversation; a new one is started otherwise
        #[arg(long)]
        conversation: Option<ConversationId>,
        /// Attach a local file (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        #[arg(long)]
        model: Option<String>,
        text: String,
    },
    /// Regenerate the turn a message belongs to
    Retry {
        #[arg(long)]
        conversation: ConversationId,
        message_id: MessageId,
        #[arg(long)]
        model: Option<String>,
    },
    /// Print a conversation's messages in order
    History {
        #[arg(long)]
        conversation: ConversationId,
    },
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("no API key configured; set CHATLINE_PROVIDER__API_KEY or edit {path}"))]
    MissingApiKey { stage: &'static str, path: String },
    #[snafu(display("failed to create completion transport: {source}"))]
    Transport {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to read attachment {path}: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("{source}"))]
    Turn {
        stage: &'static str,
        source: SendError,
    },
}

type CliResult<T> = Result<T, CliError>;

/// Streams visible deltas to stdout; images and reasoning go to stderr.
struct TerminalHooks;

impl ChatHooks for TerminalHooks {
    fn on_delta(&self, _conversation_id: ConversationId, event: &StreamEvent) {
        match event {
            StreamEvent::Text(delta) => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(delta.as_bytes());
                let _ = stdout.flush();
            }
            StreamEvent::Reasoning(_) => {}
            StreamEvent::Image { index, .. } => eprintln!("\n[image {index}]"),
            StreamEvent::Done => println!(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::debug!(error = ?error, "chatline failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run(cli: Cli) -> CliResult<()> {
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = store.settings();

    if cli.ephemeral {
        run_with(Arc::new(InMemoryStorage::new()), &store, &settings, cli.command).await
    } else {
        let location = settings.storage.database_path.to_string_lossy().into_owned();
        let storage = SqliteStorage::open(&location).await.context(StorageSnafu {
            stage: "cli-open-database",
        })?;
        run_with(Arc::new(storage), &store, &settings, cli.command).await
    }
}

async fn run_with<S>(
    storage: Arc<S>,
    store: &SettingsStore,
    settings: &ChatSettings,
    command: Command,
) -> CliResult<()>
where
    S: Storage + 'static,
{
    match command {
        Command::Send {
            conversation,
            attachments,
            model,
            text,
        } => {
            let conversation_id = conversation.unwrap_or_else(ConversationId::new_v7);
            let attachments = store_attachments(storage.as_ref(), &attachments).await?;
            let mut request = SendRequest::text(text).with_attachments(attachments);
            if let Some(model) = model {
                request = request.with_model(model);
            }

            let orchestrator = build_orchestrator(storage, store, settings)?;
            eprintln!("conversation {conversation_id}");
            let outcome = with_ctrl_c_abort(&orchestrator, conversation_id, |orchestrator| {
                Box::pin(async move { orchestrator.send(conversation_id, request).await })
            })
            .await?;
            report(&outcome);
            Ok(())
        }
        Command::Retry {
            conversation,
            message_id,
            model,
        } => {
            let orchestrator = build_orchestrator(storage, store, settings)?;
            let outcome = with_ctrl_c_abort(&orchestrator, conversation, |orchestrator| {
                Box::pin(async move { orchestrator.retry(conversation, message_id, model).await })
            })
            .await?;
            report(&outcome);
            Ok(())
        }
        Command::History { conversation } => {
            let messages = storage
                .list_messages(conversation)
                .await
                .context(StorageSnafu {
                    stage: "cli-list-history",
                })?;
            for message in &messages {
                print_message(message);
            }
            Ok(())
        }
    }
}

fn build_orchestrator<S>(
    storage: Arc<S>,
    store: &SettingsStore,
    settings: &ChatSettings,
) -> CliResult<Arc<SendOrchestrator>>
where
    S: Storage + 'static,
{
    let Some(provider_config) = settings.provider.to_provider_config() else {
        return MissingApiKeySnafu {
            stage: "cli-build-orchestrator",
            path: store.config_path().display().to_string(),
        }
        .fail();
    };
    let transport = create_transport(provider_config).context(TransportSnafu {
        stage: "cli-build-orchestrator",
    })?;

    let orchestrator = SendOrchestrator::new(
        storage,
        transport,
        Arc::new(HydrationCache::new()),
        OrchestratorConfig::from_settings(settings),
    )
    .context(TurnSnafu {
        stage: "cli-build-orchestrator",
    })?
    .with_hooks(Arc::new(TerminalHooks));
    Ok(Arc::new(orchestrator))
}

type TurnFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<TurnOutcome, SendError>> + Send>,
>;

/// Runs one turn; the first Ctrl-C aborts it instead of killing the process.
async fn with_ctrl_c_abort<F>(
    orchestrator: &Arc<SendOrchestrator>,
    conversation_id: ConversationId,
    turn: F,
) -> CliResult<TurnOutcome>
where
    F: FnOnce(Arc<SendOrchestrator>) -> TurnFuture,
{
    let watcher = {
        let orchestrator = Arc::clone(orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && orchestrator.abort(conversation_id) {
                eprintln!("\naborting...");
            }
        })
    };

    let result = turn(Arc::clone(orchestrator)).await;
    watcher.abort();
    result.context(TurnSnafu { stage: "cli-turn" })
}

fn report(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Completed {
            assistant_message_id,
            ..
        } => eprintln!("message {assistant_message_id}"),
        TurnOutcome::Aborted {
            assistant_message_id: Some(id),
            ..
        } => eprintln!("aborted, partial reply kept in {id}"),
        TurnOutcome::Aborted {
            assistant_message_id: None,
            ..
        } => eprintln!("aborted before the reply started"),
    }
}

async fn store_attachments<S>(storage: &S, paths: &[PathBuf]) -> CliResult<Vec<ContentHash>>
where
    S: Storage,
{
    let mut hashes = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
            stage: "cli-read-attachment",
            path: path.display().to_string(),
        })?;
        let metadata = storage
            .put_content(NewContent {
                bytes: bytes.into(),
                media_type: attachment_media_type(path).to_string(),
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
            })
            .await
            .context(StorageSnafu {
                stage: "cli-store-attachment",
            })?;
        tracing::debug!(path = %path.display(), hash = %metadata.hash, "attachment stored");
        hashes.push(metadata.hash);
    }
    Ok(hashes)
}

fn attachment_media_type(path: &Path) -> &'static str {
    classify_media_type(&path.to_string_lossy()).unwrap_or(FALLBACK_MEDIA_TYPE)
}

fn print_message(message: &MessageRecord) {
    let mut flags = Vec::new();
    if message.pending {
        flags.push("pending".to_string());
    }
    if !message.attachments.is_empty() {
        flags.push(format!("{} attachment(s)", message.attachments.len()));
    }
    if let Some(model) = &message.model {
        flags.push(model.clone());
    }

    println!(
        "#{} {} {} {}",
        message.seq,
        message.role.as_str(),
        message.id,
        if flags.is_empty() {
            String::new()
        } else {
            format!("[{}]", flags.join(", "))
        }
    );
    println!("{}", message.content.text());
    if let Some(error) = &message.error {
        println!("! {error}");
    }
    println!();
}
