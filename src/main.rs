use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use followup_agent::{
    config::{Config, ExtractionStrategy, LogFormat},
    followup::{Agent, AgentReply, FollowUpAgent, LangbaseResponder, TurnController},
    langbase::LangbaseClient,
    prompts::system_prompt_for,
    storage::{InMemoryStorage, SessionStore, SqliteStorage},
    AppError, TurnError,
};

#[derive(Parser)]
#[command(
    name = "followup-agent",
    about = "Asks the clarifying questions a financial query is missing",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Keep sessions in memory instead of the SQLite database
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Do not create or update the Langbase pipe on startup
    #[arg(long, global = true)]
    skip_pipe_setup: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single turn and print the reply
    Ask {
        /// The user's query
        query: String,

        /// Session to continue (a new one is started if omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Print the full reply as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive conversation on one session
    Chat {
        /// Session to continue (a new one is started if omitted)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Print a stored session as JSON
    Show {
        /// Session id
        session: String,
    },

    /// Delete a stored session
    End {
        /// Session id
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        extraction = %config.follow_up.extraction,
        "Follow-up agent starting..."
    );

    let store = open_store(&config, cli.ephemeral).await?;

    match cli.command {
        Commands::Show { session } => show(store.as_ref(), &session).await,
        Commands::End { session } => {
            store
                .delete_session(&session)
                .await
                .with_context(|| format!("Failed to delete session {}", session))?;
            println!("Session {} ended", session);
            Ok(())
        }
        Commands::Ask {
            query,
            session,
            json,
        } => {
            let agent = build_agent(&config, store, cli.skip_pipe_setup).await?;
            let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
            let handle = agent.open_session(&session_id).await?;
            let reply = agent.run_turn(&handle, &query).await?;
            print_reply(&reply, json)?;
            Ok(())
        }
        Commands::Chat { session } => {
            let agent = build_agent(&config, store, cli.skip_pipe_setup).await?;
            let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
            chat(&agent, &session_id).await
        }
    }
}

async fn open_store(config: &Config, ephemeral: bool) -> anyhow::Result<Arc<dyn SessionStore>> {
    if ephemeral {
        info!("Using in-memory session store");
        return Ok(Arc::new(InMemoryStorage::new()));
    }

    match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            Ok(Arc::new(s))
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            Err(e.into())
        }
    }
}

async fn build_agent(
    config: &Config,
    store: Arc<dyn SessionStore>,
    skip_pipe_setup: bool,
) -> anyhow::Result<FollowUpAgent> {
    let client = match LangbaseClient::new(&config.langbase, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.langbase.base_url, "Langbase client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Langbase client");
            return Err(e.into());
        }
    };

    if !skip_pipe_setup {
        let strategy = config.follow_up.extraction;
        let json_output = strategy == ExtractionStrategy::Structured;
        if let Err(e) = client
            .ensure_follow_up_pipe(
                &config.pipes.follow_up,
                system_prompt_for(strategy),
                json_output,
            )
            .await
        {
            error!(error = %e, "Failed to ensure follow-up pipe exists");
            return Err(e.into());
        }
    }

    let responder = Arc::new(LangbaseResponder::new(client, &config.pipes.follow_up));
    let controller = TurnController::from_config(config, responder);
    Ok(FollowUpAgent::new(controller, store).with_pipe_name(&config.pipes.follow_up))
}

async fn show(store: &dyn SessionStore, session_id: &str) -> anyhow::Result<()> {
    let session = store
        .load_session(session_id)
        .await?
        .with_context(|| format!("Session {} not found", session_id))?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

fn print_reply(reply: &AgentReply, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reply)?);
    } else {
        println!("{}", reply.message);
        eprintln!("(session {})", reply.session_id);
    }
    Ok(())
}

/// Read queries from stdin until EOF or `/quit`. Ctrl-C cancels the turn in
/// flight; the session keeps its pre-turn state.
async fn chat(agent: &FollowUpAgent, session_id: &str) -> anyhow::Result<()> {
    let handle = agent.open_session(session_id).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    eprintln!("Session {}. Type /quit to leave.", session_id);

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        // Ctrl-C at the prompt leaves the session; during a turn it cancels the turn.
        let Some(query) = next_query(&mut lines, tokio::signal::ctrl_c()).await? else {
            eprintln!();
            break;
        };

        let cancel = CancellationToken::new();
        let turn = agent.run_turn_with_cancel(&handle, &query, cancel.clone());
        tokio::pin!(turn);
        let result = tokio::select! {
            result = &mut turn => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                turn.await
            }
        };

        match result {
            Ok(reply) => println!("{}", reply.message),
            Err(AppError::Turn(TurnError::Cancelled { .. })) => {
                warn!(session_id, "Turn cancelled");
                eprintln!("(cancelled)");
            }
            Err(e) if is_retryable(&e) => eprintln!("Temporary failure, try again: {}", e),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    Ok(())
}

/// Next non-blank query, or `None` once the user quits with `/quit`, end of
/// input or `interrupt` firing.
async fn next_query<R, F>(lines: &mut Lines<R>, interrupt: F) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future,
{
    tokio::pin!(interrupt);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut interrupt => return Ok(None),
        };
        let Some(line) = line else {
            return Ok(None);
        };
        match line.trim() {
            "" => continue,
            "/quit" => return Ok(None),
            query => return Ok(Some(query.to_string())),
        }
    }
}

fn is_retryable(err: &AppError) -> bool {
    matches!(err, AppError::Turn(turn) if turn.is_retryable())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{pending, ready};

    #[tokio::test]
    async fn test_next_query_skips_blank_lines_and_stops_at_quit() {
        let input: &[u8] = b"\n   \n  Which fund?  \n/quit\nnever read\n";
        let mut lines = BufReader::new(input).lines();

        let first = next_query(&mut lines, pending::<()>()).await.unwrap();
        assert_eq!(first.as_deref(), Some("Which fund?"));
        assert_eq!(next_query(&mut lines, pending::<()>()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_query_ends_at_eof() {
        let mut lines = BufReader::new(&b""[..]).lines();
        assert_eq!(next_query(&mut lines, pending::<()>()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_interrupt_at_idle_prompt_quits() {
        // The writer stays open, so reading would block forever.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(next_query(&mut lines, ready(())).await.unwrap(), None);
    }
}
