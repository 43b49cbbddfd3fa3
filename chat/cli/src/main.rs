//! Gateway Chat - Line-Oriented Terminal Client
//!
//! A thin surface over `chat-core`: every line typed is sent as a user
//! message and the assistant's reply is printed as it streams in. Lines
//! starting with `/` are commands.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (config file, then environment)
//! gateway-chat
//!
//! # Point at another gateway and model
//! gateway-chat --gateway-url https://gw.example.com/api --model gpt-4o
//!
//! # Authenticate
//! CHAT_API_TOKEN=... gateway-chat
//!
//! # Verbose logging (written to stderr)
//! RUST_LOG=chat_core=debug gateway-chat
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: stops the streaming response; exits when nothing is streaming

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{info, warn};

use chat_core::config::{load_config_from_path, ConfigOverrides};
use chat_core::{ChatBackend, ChatClient, ChatError, GatewayBackend, SessionStatus, SessionUpdate};

const HELP: &str = "\
Commands:
  /new [title]     start a conversation
  /list            list conversations
  /switch <n>      make conversation n active
  /rename <title>  rename the active conversation
  /delete [n]      delete conversation n (default: active)
  /stop            stop the streaming response
  /retry           resend the last message
  /health          probe the gateway
  /help            show this help
  /quit            exit";

/// Gateway Chat - streaming chat client for a chat-completions gateway
#[derive(Parser, Debug)]
#[command(name = "gateway-chat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CHAT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Gateway base URL
    #[arg(short = 'g', long, value_name = "URL")]
    gateway_url: Option<String>,

    /// Model identifier
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// System prompt sent with every request
    #[arg(long, value_name = "TEXT")]
    system_prompt: Option<String>,

    /// Bearer token for the gateway
    #[arg(long, env = "CHAT_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CHAT_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging on stderr so it never interleaves with replies
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_chat={level},chat_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

enum Flow {
    Continue,
    Quit,
}

struct Terminal {
    out: Stdout,
}

impl Terminal {
    async fn print(&mut self, text: &str) -> Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await?;
        Ok(())
    }

    async fn line(&mut self, text: &str) -> Result<()> {
        self.print(&format!("{text}\n")).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(url) = args.gateway_url {
        overrides = overrides.with_base_url(url);
    }
    if let Some(model) = args.model {
        overrides = overrides.with_model(model);
    }
    if let Some(prompt) = args.system_prompt {
        overrides = overrides.with_system_prompt(prompt);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(
        source = %config.source(),
        gateway = %config.gateway.base_url,
        model = %config.chat.model,
        "Configuration loaded"
    );

    let mut backend =
        GatewayBackend::new(config.gateway.clone()).context("Failed to create gateway client")?;
    if let Some(token) = args.token {
        backend = backend.with_token_provider(move || Some(token.clone()));
    }

    let mut client = ChatClient::new(backend, config);
    let mut term = Terminal {
        out: tokio::io::stdout(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    term.line("Type a message, or /help for commands.").await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if let Flow::Quit = handle_line(&mut client, &mut term, line.trim()).await? {
                    break;
                }
            }
            Some(update) = client.next_update(), if client.has_active_streams() => {
                render_update(&client, &mut term, update).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                if client.stop() {
                    term.line("\n[stopped]").await?;
                } else {
                    break;
                }
            }
        }
    }

    client.stop();
    info!("Exiting");
    Ok(())
}

async fn handle_line(
    client: &mut ChatClient<GatewayBackend>,
    term: &mut Terminal,
    line: &str,
) -> Result<Flow> {
    if line.is_empty() {
        return Ok(Flow::Continue);
    }

    let Some(command) = line.strip_prefix('/') else {
        match client.send(line) {
            Ok(_) => term.print("assistant> ").await?,
            Err(e) => report(term, &e).await?,
        }
        return Ok(Flow::Continue);
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));

    match name {
        "quit" | "exit" => return Ok(Flow::Quit),
        "help" => term.line(HELP).await?,
        "new" => {
            let title = if rest.is_empty() { "New conversation" } else { rest };
            client.create_conversation(title);
            term.line(&format!("[new conversation: {title}]")).await?;
        }
        "list" => list_conversations(client, term).await?,
        "switch" => match conversation_at(client, rest) {
            Some(id) => {
                client.select_conversation(id)?;
                print_history(client, term).await?;
            }
            None => term.line("[no such conversation]").await?,
        },
        "rename" => match client.store().active_conversation_id() {
            Some(id) if !rest.is_empty() => {
                client.rename_conversation(id, rest)?;
                term.line(&format!("[renamed to: {rest}]")).await?;
            }
            Some(_) => term.line("[usage: /rename <title>]").await?,
            None => report(term, &ChatError::NoActiveConversation).await?,
        },
        "delete" => {
            let target = if rest.is_empty() {
                client.store().active_conversation_id()
            } else {
                conversation_at(client, rest)
            };
            match target {
                Some(id) => {
                    let removed = client.delete_conversation(id)?;
                    term.line(&format!("[deleted: {}]", removed.title)).await?;
                }
                None => term.line("[no such conversation]").await?,
            }
        }
        "stop" => {
            if client.stop() {
                term.line("\n[stopped]").await?;
            } else {
                term.line("[nothing is streaming]").await?;
            }
        }
        "retry" => match client.retry_last() {
            Ok(_) => term.print("assistant> ").await?,
            Err(e) => report(term, &e).await?,
        },
        "health" => {
            let healthy = client.backend().health_check().await;
            let state = if healthy { "reachable" } else { "unreachable" };
            term.line(&format!("[gateway {state}]")).await?;
        }
        other => {
            warn!(command = other, "Unknown command");
            term.line(&format!("[unknown command /{other}; try /help]")).await?;
        }
    }

    Ok(Flow::Continue)
}

async fn render_update(
    client: &ChatClient<GatewayBackend>,
    term: &mut Terminal,
    update: SessionUpdate,
) -> Result<()> {
    // Replies for conversations in the background are only visible via /switch
    if client.store().active_conversation_id() != Some(update.conversation_id()) {
        return Ok(());
    }

    match update {
        SessionUpdate::Delta { fragment, .. } => term.print(&fragment).await,
        SessionUpdate::Completed { .. } => term.line("").await,
        SessionUpdate::Failed {
            conversation_id,
            message_id,
            error,
        } => {
            let fallback = client
                .store()
                .get_message(conversation_id, &message_id)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            term.line(&format!("\n{fallback}")).await?;
            report(term, &error).await?;
            if error.is_retryable() {
                term.line("[type /retry to try again]").await?;
            }
            Ok(())
        }
    }
}

async fn report(term: &mut Terminal, error: &ChatError) -> Result<()> {
    term.line(&format!("[error: {error}]")).await
}

fn conversation_at(
    client: &ChatClient<GatewayBackend>,
    index: &str,
) -> Option<chat_core::ConversationId> {
    let index: usize = index.parse().ok()?;
    client
        .store()
        .conversations()
        .get(index.checked_sub(1)?)
        .map(|c| c.id)
}

async fn list_conversations(client: &ChatClient<GatewayBackend>, term: &mut Terminal) -> Result<()> {
    let conversations = client.store().conversations();
    if conversations.is_empty() {
        return term.line("[no conversations]").await;
    }

    let active = client.store().active_conversation_id();
    for (i, conversation) in conversations.iter().enumerate() {
        let marker = if Some(conversation.id) == active { '*' } else { ' ' };
        let status = match client.status_of(conversation.id) {
            SessionStatus::Sending | SessionStatus::Streaming => " (streaming)",
            SessionStatus::Failed => " (failed)",
            _ => "",
        };
        let count = client.store().list_messages(conversation.id).len();
        term.line(&format!(
            "{marker} {}. {} [{count} messages]{status}",
            i + 1,
            conversation.title
        ))
        .await?;
    }
    Ok(())
}

async fn print_history(client: &ChatClient<GatewayBackend>, term: &mut Terminal) -> Result<()> {
    let Some(id) = client.store().active_conversation_id() else {
        return Ok(());
    };
    for message in client.store().list_messages(id) {
        term.line(&format!("{}> {}", message.role.as_str(), message.content))
            .await?;
        if let Some(ref error) = message.error {
            term.line(&format!("[error: {error}]")).await?;
        }
    }
    Ok(())
}
