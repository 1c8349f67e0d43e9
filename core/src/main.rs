/// ChatSync - command line entry point
use chatsync_core::sync::{handler, TimelineEntry};
use chatsync_core::transport::HttpFeed;
use chatsync_core::types::{Direction, EnvelopePayload};
use chatsync_core::{
    ConversationId, Envelope, FeedServer, ScopeKey, SyncConfig, SyncEvent, SyncSession,
};
use colored::*;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (config, positional) = SyncConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = positional.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "serve" => {
            let port = match positional.get(1) {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|e| anyhow::anyhow!("invalid port {}: {}", p, e))?,
                None => 7070,
            };
            serve(port).await?;
        }
        "watch" => {
            let Some(target) = positional.get(1) else {
                eprintln!("{}", "Usage: chatsync watch <conversation|all>".yellow());
                return Ok(());
            };
            watch(config, target).await?;
        }
        "send" | "inbound" => {
            if positional.len() < 3 {
                eprintln!(
                    "{}",
                    format!("Usage: chatsync {} <conversation> <message>", command).yellow()
                );
                return Ok(());
            }
            let conversation = ConversationId::new(positional[1].clone());
            let content = positional[2..].join(" ");
            if command == "send" {
                send(config, &conversation, &content).await?;
            } else {
                inbound(&config, &conversation, &content).await?;
            }
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("{}", "⚡ ChatSync".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  chatsync [flags] <command> [args]");
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} [port]                      Run a local feed server (socket on port+1)", "serve".cyan());
    println!("  {} <conversation|all>          Follow a timeline or the chat list", "watch".cyan());
    println!("  {} <conversation> <message>     Send as the operator", "send".cyan());
    println!("  {} <conversation> <message>  Post a customer message to the feed", "inbound".cyan());
    println!();
    println!("{}", "Flags:".bright_white().bold());
    println!("  --server <url>   --socket <url>   --poll-ms <ms>   --grace-ms <ms>   --no-socket");
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let feed = FeedServer::new();
    let running = feed
        .start(port)
        .await
        .map_err(|e| anyhow::anyhow!("Feed server error: {}", e))?;
    println!(
        "{} Feed server on {} (socket {})",
        "✓".green().bold(),
        running.http_url().bright_white(),
        running.socket_url().bright_white()
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down feed server ({} updates logged)", feed.len());
    Ok(())
}

async fn watch(config: SyncConfig, target: &str) -> anyhow::Result<()> {
    let session = SyncSession::from_config(config)?;
    let scope = if target == "all" {
        ScopeKey::AllConversations
    } else {
        ScopeKey::Conversation(ConversationId::new(target))
    };

    let printer = handler(|envelope: &Envelope| {
        print_envelope(envelope);
        Ok(())
    });
    let subscription = session.subscribe(scope.clone(), vec![printer]);
    let mut events = session.events();
    println!(
        "{} Watching {} (ctrl-c to stop)",
        "→".cyan(),
        subscription.scope().to_string().bright_white()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::StatusChanged { status, .. }) => {
                    let label = if status.connected { "connected".green() } else { "offline".red() };
                    let transport = status
                        .transport
                        .map(|t| format!(" via {}", t))
                        .unwrap_or_default();
                    println!("{} {}{}", "●".dimmed(), label, transport.dimmed());
                }
                Ok(SyncEvent::TimelineChanged { conversation, delta }) => {
                    for anomaly in &delta.anomalies {
                        println!(
                            "{} {} message missing {}",
                            "⚠".yellow(),
                            conversation,
                            anomaly.missing.join(", ")
                        );
                    }
                }
                Ok(SyncEvent::SendFailed { local_id, error, .. }) => {
                    println!("{} send {} failed: {}", "✗".red().bold(), local_id, error);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event printer lagged {} events", n);
                }
                Err(_) => break,
            }
        }
    }

    session.shutdown();
    Ok(())
}

async fn send(config: SyncConfig, conversation: &ConversationId, content: &str) -> anyhow::Result<()> {
    let session = SyncSession::from_config(config)?;
    session.subscribe(ScopeKey::Conversation(conversation.clone()), Vec::new());

    match session.send(conversation, content).await {
        Ok(local_id) => println!("{} Sent {}", "✓".green().bold(), local_id.to_string().dimmed()),
        Err(e) => println!("{} Send failed: {}", "✗".red().bold(), e),
    }
    for entry in session.timeline(conversation) {
        print_entry(&entry);
    }

    session.shutdown();
    Ok(())
}

async fn inbound(config: &SyncConfig, conversation: &ConversationId, content: &str) -> anyhow::Result<()> {
    let feed = HttpFeed::new(config.server_url.clone(), config.request_timeout);
    let message = feed
        .post_message(conversation, content, Direction::Inbound)
        .await
        .map_err(|e| anyhow::anyhow!("Post failed: {}", e))?;
    println!(
        "{} Posted {} to {}",
        "✓".green().bold(),
        message.server_id.unwrap_or_default().dimmed(),
        conversation.to_string().bright_white()
    );
    Ok(())
}

fn print_envelope(envelope: &Envelope) {
    let when = envelope.observed_at.format("%H:%M:%S").to_string();
    match &envelope.payload {
        EnvelopePayload::NewMessage(message) | EnvelopePayload::GlobalNewMessage(message) => {
            let arrow = match message.direction {
                Some(Direction::Outbound) => "→".cyan(),
                Some(Direction::Inbound) => "←".green(),
                None => "?".yellow(),
            };
            println!(
                "{} {} {} {}",
                when.dimmed(),
                arrow,
                envelope
                    .conversation()
                    .map(|c| c.to_string())
                    .unwrap_or_default()
                    .bright_white(),
                message.content.as_deref().unwrap_or("<no content>")
            );
        }
        EnvelopePayload::ChatUpdated(summary) => {
            println!(
                "{} {} {} unread, last: {}",
                when.dimmed(),
                summary.conversation_id.to_string().bright_white(),
                summary.unread_count.to_string().yellow(),
                summary.last_preview.as_deref().unwrap_or("")
            );
        }
    }
}

fn print_entry(entry: &TimelineEntry) {
    let state = if entry.failed {
        "failed".red()
    } else if entry.confirmed {
        "✓".green()
    } else {
        "…".yellow()
    };
    println!(
        "  {} {} {}",
        entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
        state,
        entry.content.as_deref().unwrap_or("")
    );
}
