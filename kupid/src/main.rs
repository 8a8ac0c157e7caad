//! `kupid`: line-oriented terminal client for Kupid chat.
//!
//! Opens one conversation and reads commands from stdin. Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/kupid/config.toml`).
//!
//! ```bash
//! cargo run --bin kupid -- --actor 12 --peer 40 \
//!     --api-base https://kupid.example/api/ --ws-base wss://kupid.example/
//! ```
//!
//! Input lines:
//! - plain text: send a message
//! - `/typing`: send a typing signal
//! - `/read`: mark everything up to the last message as read
//! - `/online <id>`: show whether a member is online
//! - `/threads`: list inbox threads
//! - `/open <id>`, `/close`: switch conversations
//! - `/quit`: exit

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use kupid::api::http::HttpApi;
use kupid::chat::ChannelEvent;
use kupid::clock::SystemClock;
use kupid::config::{CliArgs, ClientConfig};
use kupid::cue::{NotificationCue, TerminalBell};
use kupid::identity::StaticIdentity;
use kupid::session::ChatSession;
use kupid::transport::ws::WsConnector;
use kupid_proto::message::ActorId;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout is the conversation view.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("kupid starting");

    let Some(actor) = config.actor else {
        eprintln!("No member id configured (use --actor or [identity] actor_id)");
        return Ok(());
    };

    let connector = Arc::new(
        WsConnector::new(config.ws_base.clone()).with_connect_timeout(config.connect_timeout),
    );
    let api = Arc::new(HttpApi::new(config.api_base.clone()).map_err(io::Error::other)?);
    let cue = Arc::new(NotificationCue::new(TerminalBell));
    let session = ChatSession::new(
        connector,
        api,
        Arc::new(StaticIdentity::new(actor)),
        Arc::new(SystemClock),
        Arc::clone(&cue) as Arc<dyn kupid::cue::Cue>,
        config.to_session_config(),
    );

    if let Err(e) = session.start() {
        eprintln!("Cannot start session: {e}");
        return Ok(());
    }
    if let Some(peer) = config.peer {
        open(&session, peer).await;
    }

    let result = run(&session, &cue).await;
    session.stop().await;

    tracing::info!("kupid exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("kupid.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(log_filter(level))
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Filter for `level`, which comes from `--log-level` or `KUPID_LOG`.
///
/// `RUST_LOG` is not consulted. An unparsable level falls back to `info`.
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("invalid log level {level:?} ({e}); using info");
        EnvFilter::new("info")
    })
}

/// Reads stdin until `/quit` or end of input, printing channel activity.
async fn run(
    session: &ChatSession<HttpApi>,
    cue: &NotificationCue<TerminalBell>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = session.channel().subscribe();
    let mut unread = session.threads().watch_unread();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                cue.on_user_gesture();
                if !handle_line(session, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(text) = describe(&event) {
                        println!("{text}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    println!("* {missed} events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                let total = *unread.borrow_and_update();
                println!("* inbox: {total} unread");
            }
        }
    }
    Ok(())
}

/// Applies one input line. Returns `false` to quit.
async fn handle_line(session: &ChatSession<HttpApi>, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/typing" => session.channel().send_typing().await,
        "/read" => {
            let last = session.channel().messages().last().map(|m| m.sent_at);
            match last {
                Some(at) => session.channel().mark_read_up_to(at).await,
                None => println!("* nothing to mark read"),
            }
        }
        "/online" => match parse_actor(arg) {
            Some(actor) => {
                let online = session.presence().is_online(actor);
                let last_seen = session
                    .presence()
                    .lookup(actor)
                    .await
                    .and_then(|p| p.last_seen)
                    .map_or_else(|| "unknown".to_string(), |secs| secs.to_string());
                println!(
                    "* {actor} is {} (last seen: {last_seen})",
                    if online { "online" } else { "offline" }
                );
            }
            None => println!("* usage: /online <id>"),
        },
        "/threads" => {
            let rows = session.threads().threads();
            if rows.is_empty() {
                println!("* no threads");
            }
            for row in rows.iter() {
                println!(
                    "* {} ({} unread): {}",
                    row.peer_id, row.unread_count, row.last_preview
                );
            }
        }
        "/open" => match parse_actor(arg) {
            Some(peer) => open(session, peer).await,
            None => println!("* usage: /open <id>"),
        },
        "/close" => session.close_conversation().await,
        _ if command.starts_with('/') => println!("* unknown command {command}"),
        _ => session.channel().send(line).await,
    }
    true
}

async fn open(session: &ChatSession<HttpApi>, peer: ActorId) {
    if let Err(e) = session.open_conversation(peer).await {
        println!("* cannot open conversation with {peer}: {e}");
        return;
    }
    for msg in session.channel().messages().iter() {
        println!("{}", format_message(msg));
    }
}

fn parse_actor(arg: &str) -> Option<ActorId> {
    arg.trim().parse::<i64>().ok().map(ActorId::new)
}

fn format_message(msg: &kupid_proto::message::Message) -> String {
    let who = msg
        .from_name
        .clone()
        .unwrap_or_else(|| msg.from.to_string());
    let mark = match (msg.delivered_at, msg.read_at) {
        (_, Some(_)) => " ✓✓",
        (Some(_), None) => " ✓",
        (None, None) => "",
    };
    format!(
        "[{}] {who}: {}{mark}",
        msg.sent_at.format("%H:%M"),
        msg.content
    )
}

fn describe(event: &ChannelEvent) -> Option<String> {
    match event {
        ChannelEvent::StateChanged(state) => Some(format!("* connection {state}")),
        ChannelEvent::MessageReceived(msg) => Some(format_message(msg)),
        ChannelEvent::Delivered { ids } => Some(format!("* {} delivered", ids.len())),
        ChannelEvent::Read { ids } => Some(format!("* {} read", ids.len())),
        ChannelEvent::TypingChanged(true) => Some("* typing…".to_string()),
        ChannelEvent::RosterChanged { count } => Some(format!("* {count} in room")),
        ChannelEvent::ReconnectScheduled { attempt, delay } => Some(format!(
            "* reconnecting in {}s (attempt {attempt})",
            delay.as_secs()
        )),
        ChannelEvent::TypingChanged(false) | ChannelEvent::HistoryInstalled { .. } => None,
    }
}
