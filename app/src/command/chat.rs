//! Multi-session chat with streamed replies.
//!
//! Replies are printed as they stream in; Ctrl+C stops the reply in flight
//! and, at the prompt, ends the session.

use std::io::Write;

use chatloom_core::{MessageId, MessageStatus};
use chatloom_session::{SessionStore, StoreError, StoreEvent, SubmitOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::init_store;

/// Input parameters for the Chat command strategy.
#[derive(Debug, Clone)]
pub struct ChatInput {
    /// Optional single message to send (non-interactive mode)
    pub message: Option<String>,
    /// Optional model override
    pub model: Option<String>,
    /// Use the local echo transport
    pub offline: bool,
    /// Skip persistence
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatStrategy;

impl super::CommandStrategy for ChatStrategy {
    type Input = ChatInput;

    async fn execute(&self, input: Self::Input) -> anyhow::Result<()> {
        let store = init_store(input.model, input.offline, input.ephemeral).await?;

        if let Some(msg) = input.message {
            let outcome = run_turn(&store, Turn::Input(msg)).await?;
            if let Some(summarize) = outcome.and_then(|o| o.summarize) {
                summarize.await?;
            }
            return Ok(());
        }

        run_interactive(&store).await
    }
}

enum Turn {
    Input(String),
    Resend(usize),
}

async fn run_interactive(store: &SessionStore) -> anyhow::Result<()> {
    let session = store.current_session().await;
    println!("=== {} ({} messages) ===", session.topic, session.message_count());
    println!("Type /help for commands, 'exit' or Ctrl+C to quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Option<JoinHandle<()>> = None;

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();

        if matches!(input, "exit" | "quit" | "q") {
            break;
        }
        if input.is_empty() {
            continue;
        }

        let turn = if let Some(command) = input.strip_prefix('/') {
            match run_command(store, command).await {
                Ok(Some(turn)) => turn,
                Ok(None) => continue,
                Err(e) => {
                    eprintln!("Error: {e}");
                    continue;
                }
            }
        } else {
            Turn::Input(input.to_string())
        };

        match run_turn(store, turn).await {
            Ok(Some(outcome)) => {
                if let Some(summarize) = outcome.summarize {
                    pending = Some(summarize);
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    // Let the last summarization land in the snapshot.
    if let Some(summarize) = pending {
        summarize.await?;
    }
    store.flush().await;

    let session = store.current_session().await;
    println!("\nSession ended: {} messages", session.message_count());
    Ok(())
}

/// Handle a slash command. Returns a turn to run when the command resubmits.
async fn run_command(store: &SessionStore, command: &str) -> anyhow::Result<Option<Turn>> {
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, arg)| (name, arg.trim()));
    let index = || -> anyhow::Result<usize> {
        arg.parse()
            .map_err(|_| anyhow::anyhow!("/{name} expects an index, got '{arg}'"))
    };

    match name {
        "new" => {
            store.new_session().await;
            println!("Started a new session.");
        }
        "list" => {
            let current = store.current_index().await;
            for (i, session) in store.sessions().await.iter().enumerate() {
                let marker = if i == current { '*' } else { ' ' };
                println!(
                    "{marker} [{i}] {} ({} messages)",
                    session.topic,
                    session.message_count()
                );
            }
        }
        "select" => {
            store.select_session(index()?).await?;
            let session = store.current_session().await;
            println!("Switched to \"{}\".", session.topic);
        }
        "remove" => {
            let removed = store.remove_session(index()?).await?;
            println!("Removed \"{}\".", removed.topic);
        }
        "clear" => {
            store.clear_sessions().await;
            println!("All sessions removed.");
        }
        "history" => {
            for (i, message) in store.current_session().await.messages.iter().enumerate() {
                println!("[{i}] {}: {}", message.role, message.content);
            }
        }
        "resend" => return Ok(Some(Turn::Resend(index()?))),
        "memory" => {
            let view = store.memory_view(store.current_index().await).await?;
            println!(
                "Summarized {} of {} messages.",
                view.last_summarize_index, view.message_count
            );
            if view.memory_prompt.is_empty() {
                println!("(no memory yet)");
            } else {
                println!("{}", view.memory_prompt);
            }
        }
        "export" => {
            println!("{}", store.export_markdown(store.current_index().await).await?);
        }
        "help" => print_help(),
        other => println!("Unknown command /{other}, try /help."),
    }
    Ok(None)
}

fn print_help() {
    println!("/new            start a new session");
    println!("/list           list sessions");
    println!("/select <i>     switch to session i");
    println!("/remove <i>     delete session i");
    println!("/clear          delete all sessions");
    println!("/history        show messages of the current session");
    println!("/resend <i>     resubmit the user message at or before message i");
    println!("/memory         show the memory summary");
    println!("/export         print the session as markdown");
}

/// Run one submission, echoing the reply as it streams.
///
/// Returns `None` when the store rejected the input.
async fn run_turn(store: &SessionStore, turn: Turn) -> anyhow::Result<Option<SubmitOutcome>> {
    let mut events = store.subscribe();
    let mut submit = tokio::spawn({
        let store = store.clone();
        async move {
            match turn {
                Turn::Input(text) => store.submit_input(&text).await,
                Turn::Resend(index) => store.resend(index).await,
            }
        }
    });

    let mut printer = ReplyPrinter::default();
    let result = loop {
        tokio::select! {
            joined = &mut submit => break joined?,
            event = events.recv() => match event {
                Ok(StoreEvent::MessageUpdated { session, message }) => {
                    printer.refresh(store, session, message).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {skipped} store events"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                stop_current(store).await;
            }
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(StoreError::EmptyInput) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    printer.refresh(store, outcome.session, outcome.message).await;
    println!();
    match outcome.status {
        MessageStatus::Cancelled => println!("(stopped)"),
        MessageStatus::Error => warn!("Reply {} ended with an error", outcome.message),
        _ => {}
    }
    println!();
    Ok(Some(outcome))
}

/// Stop the newest message of the current session.
async fn stop_current(store: &SessionStore) {
    let index = store.current_index().await;
    let last = store.current_session().await.messages.len().checked_sub(1);
    if let Some(last) = last {
        if store.stop_message(index, last).await {
            info!("Stopped reply at message {last}");
        }
    }
}

/// Prints the part of a reply that has not been shown yet.
#[derive(Default)]
struct ReplyPrinter {
    target: Option<(Uuid, MessageId)>,
    shown: String,
}

impl ReplyPrinter {
    async fn refresh(&mut self, store: &SessionStore, session: Uuid, message: MessageId) {
        match self.target {
            Some(target) if target != (session, message) => return,
            None => self.target = Some((session, message)),
            Some(_) => {}
        }

        let Some(message) = store.message(session, message).await else {
            return;
        };
        if message.content.starts_with(&self.shown) {
            print!("{}", &message.content[self.shown.len()..]);
        } else {
            // Content was replaced, e.g. by an error indicator.
            print!("\n{}", message.content);
        }
        let _ = std::io::stdout().flush();
        self.shown = message.content;
    }
}
