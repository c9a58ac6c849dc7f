/// ChatLink terminal client - opens one conversation and chats line by line
use chatlink_core::{
    Config, ConnectionState, ConversationSession, EnvCredentials, HttpHistory, LoadOutcome,
    MessageStatus, NetworkConnector, SessionContext, SessionSnapshot,
};
use colored::*;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let conversation_id = args[2].clone();

    info!("Starting ChatLink client");
    info!("   Server: {} ({} preferred)", config.socket_addr, config.preferred_transport);
    info!("   REST:   {}", config.http_base);

    let connector = NetworkConnector::new(&config);
    let http_base = config.http_base.clone();
    let session = Arc::new(
        SessionContext::login(config, connector, &EnvCredentials)
            .await
            .map_err(|e| anyhow::anyhow!("Login failed: {}", e))?,
    );
    let history = HttpHistory::new(http_base, session.credential());
    let chat = ConversationSession::new(session.clone(), history).await;

    let printer = tokio::spawn(print_updates(chat.subscribe(), session.user_id().to_string()));

    match chat.open(&conversation_id).await {
        Ok(LoadOutcome::Loaded { added, has_more }) => {
            println!(
                "{} Loaded {} messages{}",
                "✓".green().bold(),
                added.to_string().cyan(),
                if has_more { " (/more for older)" } else { "" }
            );
        }
        Ok(_) => {}
        Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        let result = match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
            ("", _) => continue,
            ("/quit", _) => break,
            ("/help", _) => {
                print_help();
                continue;
            }
            ("/more", _) => chat.load_more().await.map(report_load),
            ("/refresh", _) => chat.refresh().await.map(report_load),
            ("/resend", id) if !id.is_empty() => chat.resend(id).await.map(|_| ()),
            ("/reconnect", _) => session.reconnect().await,
            _ => chat.send_message(line).await.map(|_| ()),
        };
        if let Err(e) = result {
            eprintln!("{} {}", "✗".red().bold(), e);
        }
    }

    info!("Shutting down");
    drop(chat);
    printer.abort();
    session.logout().await;
    Ok(())
}

fn print_help() {
    println!();
    println!("Type a message and press enter to send it.");
    println!("  {}            Load older messages", "/more".cyan());
    println!("  {}         Reload the newest page", "/refresh".cyan());
    println!("  {}     Resend a failed message", "/resend <id>".cyan());
    println!("  {}       Retry the connection", "/reconnect".cyan());
    println!("  {}            Leave", "/quit".cyan());
    println!();
}

fn report_load(outcome: LoadOutcome) {
    match outcome {
        LoadOutcome::Loaded { added, has_more } => println!(
            "{} {} older messages{}",
            "✓".green(),
            added.to_string().cyan(),
            if has_more { "" } else { ", no more history" }
        ),
        LoadOutcome::Skipped => println!("{}", "Nothing to load".yellow()),
        LoadOutcome::Discarded => {}
    }
}

/// Print new messages, status changes and indicators as snapshots arrive
async fn print_updates(mut rx: watch::Receiver<SessionSnapshot>, me: String) {
    let mut shown: HashMap<String, MessageStatus> = HashMap::new();
    let mut connection = ConnectionState::Disconnected;
    let mut typing = false;
    let mut last_error = None;

    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();

        if snapshot.connection != connection {
            connection = snapshot.connection;
            let label = format!("{:?}", connection);
            let label = match connection {
                ConnectionState::Connected => label.green(),
                ConnectionState::Failed => label.red(),
                _ => label.yellow(),
            };
            match snapshot.transport {
                Some(transport) => println!("[connection] {} via {}", label, transport),
                None => println!("[connection] {}", label),
            }
        }

        // oldest first on screen
        for message in snapshot.messages.iter().rev() {
            let mine = message.is_from(&me);
            match shown.insert(message.id.clone(), message.status) {
                // peer messages are printed once, ours again on every status change
                Some(_) if !mine => continue,
                Some(previous) if previous == message.status => continue,
                _ => {}
            }
            let time = message.created_at.format("%H:%M");
            if mine {
                let status = match message.status {
                    MessageStatus::Sending => "…".dimmed(),
                    MessageStatus::Sent => "✓".normal(),
                    MessageStatus::Delivered => "✓✓".normal(),
                    MessageStatus::Read => "✓✓".blue(),
                    MessageStatus::Failed => format!("failed, /resend {}", message.id).red(),
                };
                println!("{} {} {} [{}]", time, "you:".green().bold(), message.body, status);
            } else {
                let name = snapshot
                    .conversation
                    .as_ref()
                    .map(|c| c.peer.display_name.clone())
                    .unwrap_or_else(|| message.sender_id.clone());
                println!("{} {} {}", time, format!("{}:", name).cyan().bold(), message.body);
            }
        }

        if snapshot.peer_typing != typing {
            typing = snapshot.peer_typing;
            if typing {
                println!("{}", "peer is typing…".dimmed());
            }
        }

        if snapshot.last_error != last_error {
            last_error = snapshot.last_error.clone();
            if let Some(error) = &last_error {
                eprintln!("{} {}", "!".red().bold(), error);
            }
        }
    }
}
