//! Interactive CLI session over a managed connection.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::{broadcast, mpsc};

use renraku_shared::ids::{RoomId, UserId};

use crate::config::ConnectionConfig;
use crate::connection::{ManagedConnection, SendOutcome};
use crate::formatter::MessageFormatter;
use crate::ui::redisplay_prompt;

/// Run the CLI chat client until the user quits or input ends.
pub async fn run_client(url: String, user_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let user_id = UserId::new(user_id)?;
    let connection = ManagedConnection::new(user_id.clone(), ConnectionConfig::new(&url));
    let mut events = connection.subscribe();

    connection.connect().await?;
    tracing::info!("Connected to {} as '{}'", url, user_id);
    println!(
        "\nYou are '{}'. Commands: /join <job>, /leave <job>, /msg <user> <text>, \
         /typing <job>, /stop <job>, /read <message-id> <sender>, /state, /quit. \
         Plain text goes to the room you joined last.\n",
        user_id
    );

    // Print inbound events as they arrive
    let me = user_id.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(formatted) = MessageFormatter::format_event(&event, &me) {
                        print!("{}", formatted);
                        redisplay_prompt(me.as_str());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("display fell behind; skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // rustyline is synchronous; run it on its own thread
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
    let prompt_user = user_id.clone();
    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {}", e);
                return;
            }
        };
        let prompt = format!("{}> ", prompt_user);
        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        rl.add_history_entry(line).ok();
                        if input_tx.send(line.to_string()).is_err() {
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    tracing::error!("Readline error: {}", err);
                    break;
                }
            }
        }
    });

    let mut current_room: Option<RoomId> = None;
    while let Some(line) = input_rx.recv().await {
        if !handle_line(&connection, &mut current_room, &line).await {
            break;
        }
    }

    connection.disconnect().await;
    event_task.abort();
    Ok(())
}

/// Returns `false` when the session should end.
async fn handle_line(
    connection: &ManagedConnection,
    current_room: &mut Option<RoomId>,
    line: &str,
) -> bool {
    if let Some(command) = line.strip_prefix('/') {
        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("quit") => return false,
            Some("state") => {
                println!(
                    "state: {:?}, queued: {}, attempts: {}",
                    connection.state().await,
                    connection.queued_len().await,
                    connection.reconnect_attempts().await
                );
            }
            Some("join") => match parse_room(parts.next()) {
                Some(room) => {
                    *current_room = Some(room.clone());
                    report(connection.join_room(room).await);
                }
                None => println!("usage: /join <job-id>"),
            },
            Some("leave") => match parse_room(parts.next()) {
                Some(room) => {
                    if current_room.as_ref() == Some(&room) {
                        *current_room = None;
                    }
                    report(connection.leave_room(room).await);
                }
                None => println!("usage: /leave <job-id>"),
            },
            Some("typing") => match parse_room(parts.next()) {
                Some(room) => report(connection.typing(room).await),
                None => println!("usage: /typing <job-id>"),
            },
            Some("stop") => match parse_room(parts.next()) {
                Some(room) => report(connection.stop_typing(room).await),
                None => println!("usage: /stop <job-id>"),
            },
            Some("msg") => {
                let recipient = parts.next().and_then(|id| UserId::new(id).ok());
                let text = parts.collect::<Vec<_>>().join(" ");
                match (recipient, text.is_empty()) {
                    (Some(recipient), false) => {
                        let (outcome, _) = connection.send_chat_to_user(recipient, text).await;
                        report(outcome);
                    }
                    _ => println!("usage: /msg <user-id> <text>"),
                }
            }
            Some("read") => {
                let message_id = parts.next();
                let sender = parts.next().and_then(|id| UserId::new(id).ok());
                match (message_id, sender) {
                    (Some(message_id), Some(sender)) => {
                        report(connection.mark_read(message_id, sender).await);
                    }
                    _ => println!("usage: /read <message-id> <sender-id>"),
                }
            }
            _ => println!("unknown command: /{}", command),
        }
        return true;
    }

    // plain text: chat to the room joined last
    match current_room {
        Some(room) => {
            let (outcome, _) = connection.send_chat_to_room(room.clone(), line).await;
            report(outcome);
        }
        None => println!("join a room first (/join <job-id>) or use /msg <user-id> <text>"),
    }
    true
}

fn parse_room(raw: Option<&str>) -> Option<RoomId> {
    raw.and_then(|id| RoomId::new(id).ok())
}

fn report(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Sent => {}
        SendOutcome::Queued => println!("(offline; queued for delivery)"),
        SendOutcome::QueuedDroppingOldest => {
            println!("(offline; queued, oldest queued message dropped)")
        }
    }
}
