//! Operator-side orchestration: starting environments and talking to their
//! control planes from the CLI.
//!
//! Two ways in: a detached run (submit, detach, walk away) and an
//! interactive session (a raw-mode prompt loop that streams the agent's log
//! output while each message runs, with Escape interrupting the in-flight
//! run). Both go through `LifecycleManager` for provisioning and
//! `ControlPlaneClient` for everything after.

use std::io::Write as _;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::{Key, Term, style};
use dialoguer::Confirm;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::AgentConfig;
use crate::http::ControlPlaneClient;
use crate::lifecycle::{AgentState, LifecycleManager};
use crate::queue::MessageStatus;
use crate::repo::RepoRef;
use crate::worker::ContainerState;

/// Poll cadence while tailing a running message or a detached environment.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn client_for(state: &AgentState) -> ControlPlaneClient {
    ControlPlaneClient::new(&state.base_url, state.routing_token.clone())
}

/// Start an environment, optionally seed it with one message, and leave it
/// running in the background.
pub async fn run_detached(
    config: AgentConfig,
    repo_ref: RepoRef,
    prompt: Option<String>,
) -> Result<()> {
    let manager = LifecycleManager::new()?;
    println!(
        "Starting {}...",
        style(&config.container_name).bold().cyan()
    );
    let state = manager.start(&config, &repo_ref).await?;
    let client = client_for(&state);

    if let Some(prompt) = prompt {
        let id = client.submit(&prompt).await?;
        println!("Queued message {}", style(&id).bold());
    }
    // Detach marks the cooperative shutdown: the environment drains its
    // queue and backlog, commits, and stops on its own.
    client.detach().await?;

    println!(
        "{} is working in the background on {}",
        style(&state.name).bold().cyan(),
        repo_ref.repo_url
    );
    println!("  follow along:  deckhand status");
    println!("  stop early:    deckhand stop {}", state.name);
    Ok(())
}

/// One event from the raw-mode terminal reader.
enum TermEvent {
    /// A full line was entered.
    Line(String),
    /// Escape was pressed.
    Interrupt,
    /// Ctrl-C, Ctrl-D on an empty line, or the terminal closed.
    Eof,
}

/// Dedicated thread owning the terminal in raw mode. Builds lines with
/// backspace handling (pasted text arrives as a burst of chars), and
/// forwards Escape immediately so it can interrupt an in-flight run.
fn spawn_key_reader() -> mpsc::UnboundedReceiver<TermEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let term = Term::stdout();
        let mut line = String::new();
        loop {
            let key = match term.read_key() {
                Ok(key) => key,
                Err(_) => {
                    let _ = tx.send(TermEvent::Eof);
                    return;
                }
            };
            match key {
                Key::Enter => {
                    let _ = term.write_line("");
                    if tx.send(TermEvent::Line(std::mem::take(&mut line))).is_err() {
                        return;
                    }
                }
                Key::Backspace => {
                    if line.pop().is_some() {
                        let _ = term.clear_chars(1);
                    }
                }
                Key::Escape => {
                    if tx.send(TermEvent::Interrupt).is_err() {
                        return;
                    }
                }
                Key::CtrlC => {
                    let _ = tx.send(TermEvent::Eof);
                    return;
                }
                Key::Char('\u{4}') if line.is_empty() => {
                    let _ = tx.send(TermEvent::Eof);
                    return;
                }
                Key::Char(c) => {
                    line.push(c);
                    let mut buf = [0u8; 4];
                    let _ = term.write_str(c.encode_utf8(&mut buf));
                }
                _ => {}
            }
        }
    });
    rx
}

/// Start an environment and run a prompt loop against it. Each submitted
/// message is tailed to completion; Escape interrupts the run in flight.
/// `exit` (or EOF) detaches, `stop` tears the environment down.
pub async fn run_interactive(
    config: AgentConfig,
    repo_ref: RepoRef,
    initial_prompt: Option<String>,
) -> Result<()> {
    let manager = LifecycleManager::new()?;
    println!(
        "Starting {}...",
        style(&config.container_name).bold().cyan()
    );
    let state = manager.start(&config, &repo_ref).await?;
    let client = client_for(&state);
    println!(
        "{} Type a task, {} to interrupt a run, {} to leave it working, {} to tear it down.",
        style("Ready.").green().bold(),
        style("Esc").bold(),
        style("exit").bold(),
        style("stop").bold()
    );

    let mut keys = spawn_key_reader();
    let mut log_cursor = tail_new_logs(&client, 0).await;

    if let Some(prompt) = initial_prompt
        && !run_one(&client, &prompt, &mut log_cursor, &mut keys).await?
    {
        return detach_or_stop(&manager, &state, &client).await;
    }

    loop {
        print!("{} ", style("you>").bold().blue());
        std::io::stdout().flush().ok();
        let Some(event) = keys.recv().await else {
            return detach_or_stop(&manager, &state, &client).await;
        };
        match event {
            TermEvent::Eof => return detach_or_stop(&manager, &state, &client).await,
            TermEvent::Interrupt => {
                println!();
                continue;
            }
            TermEvent::Line(line) => match line.trim() {
                "" => continue,
                "exit" | "quit" | "detach" => {
                    return detach_or_stop(&manager, &state, &client).await;
                }
                "stop" => {
                    let _ = client.stop().await;
                    manager.stop(&state).await?;
                    println!("{}", style("Stopped.").yellow());
                    return Ok(());
                }
                prompt => {
                    if !run_one(&client, prompt, &mut log_cursor, &mut keys).await? {
                        return detach_or_stop(&manager, &state, &client).await;
                    }
                }
            },
        }
    }
}

/// Leave the environment to finish its queued work. When the detach call
/// itself fails the environment is likely already gone; fall back to a hard
/// local stop so nothing stays registered.
async fn detach_or_stop(
    manager: &LifecycleManager,
    state: &AgentState,
    client: &ControlPlaneClient,
) -> Result<()> {
    if client.detach().await.is_ok() {
        println!(
            "Detached. {} will finish its queue and stop itself.",
            style(&state.name).cyan()
        );
    } else {
        manager.stop(state).await?;
        println!("{}", style("Environment was unreachable; stopped.").yellow());
    }
    Ok(())
}

/// Submit one message and tail logs until it reaches a terminal status.
/// Returns `false` when the user hit EOF mid-run and the session should end.
async fn run_one(
    client: &ControlPlaneClient,
    prompt: &str,
    log_cursor: &mut usize,
    keys: &mut mpsc::UnboundedReceiver<TermEvent>,
) -> Result<bool> {
    let id = client.submit(prompt).await?;
    loop {
        tokio::select! {
            event = keys.recv() => match event {
                Some(TermEvent::Interrupt) => {
                    if client.interrupt().await.unwrap_or(false) {
                        println!("{}", style("Interrupted.").yellow());
                    }
                }
                Some(TermEvent::Eof) | None => {
                    let _ = client.interrupt().await;
                    return Ok(false);
                }
                // Typed-ahead lines are dropped while a run is in flight.
                Some(TermEvent::Line(_)) => {}
            },
            _ = sleep(POLL_INTERVAL) => {}
        }

        *log_cursor = tail_new_logs(client, *log_cursor).await;

        let view = client.message(&id).await?;
        match view.status {
            MessageStatus::Done => {
                if let Some(outcome) = view.result {
                    println!(
                        "{} {} turns, ${:.4}",
                        style("done:").green().bold(),
                        outcome.num_turns,
                        outcome.cost_usd
                    );
                }
                return Ok(true);
            }
            MessageStatus::Error => {
                println!(
                    "{} {}",
                    style("error:").red().bold(),
                    view.error.unwrap_or_else(|| "unknown".to_string())
                );
                return Ok(true);
            }
            MessageStatus::Queued | MessageStatus::Processing => {}
        }
    }
}

async fn tail_new_logs(client: &ControlPlaneClient, cursor: usize) -> usize {
    match client.logs(cursor).await {
        Ok(slice) => {
            for line in &slice.items {
                println!("  {}", style(line).dim());
            }
            slice.next_offset
        }
        Err(_) => cursor,
    }
}

/// Tail the most recently started environment until it stops or the user
/// hits Ctrl-C.
pub async fn cmd_status() -> Result<()> {
    let manager = LifecycleManager::new()?;
    let state = match manager.state_file().load()? {
        Some(state) => state,
        None => {
            let mut live = manager.list_live().await?;
            match live.pop() {
                Some(entry) => entry.state,
                None => {
                    println!("No running environments.");
                    return Ok(());
                }
            }
        }
    };
    let client = client_for(&state);
    if !client.is_healthy().await {
        println!(
            "{} is not responding; it may have already stopped.",
            style(&state.name).cyan()
        );
        return Ok(());
    }

    println!(
        "Watching {} (Ctrl-C to leave it running)",
        style(&state.name).bold().cyan()
    );
    let mut log_cursor = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            _ = sleep(POLL_INTERVAL) => {}
        }

        log_cursor = tail_new_logs(&client, log_cursor).await;

        let Ok(status) = client.status().await else {
            println!("{}", style("Environment stopped responding.").yellow());
            return Ok(());
        };
        if status.state == ContainerState::Stopped {
            println!(
                "{} queue drained, total cost ${:.4}",
                style("Finished:").green().bold(),
                status.total_cost_usd
            );
            manager.stop(&state).await?;
            return Ok(());
        }
    }
}

/// Stop one named environment, or every live one when no name is given.
pub async fn cmd_stop(name: Option<String>, force: bool) -> Result<()> {
    let manager = LifecycleManager::new()?;
    let targets: Vec<AgentState> = match &name {
        Some(name) => {
            let live = manager.list_live().await?;
            let found = live
                .into_iter()
                .find(|entry| entry.state.name == *name)
                .map(|entry| entry.state);
            match found {
                Some(state) => vec![state],
                None => bail!("No running environment named '{name}'"),
            }
        }
        None => manager
            .list_live()
            .await?
            .into_iter()
            .map(|entry| entry.state)
            .collect(),
    };
    if targets.is_empty() {
        println!("Nothing to stop.");
        return Ok(());
    }

    if name.is_none() && targets.len() > 1 && !force {
        let proceed = tokio::task::spawn_blocking({
            let count = targets.len();
            move || {
                Confirm::new()
                    .with_prompt(format!("Stop all {count} running environments?"))
                    .default(false)
                    .interact()
            }
        })
        .await?
        .context("confirmation prompt failed")?;
        if !proceed {
            println!("Aborted.");
            return Ok(());
        }
    }

    for state in targets {
        // Ask the worker to halt first so an in-flight run is cancelled
        // before the environment is torn out from under it.
        let _ = client_for(&state).stop().await;
        manager.stop(&state).await?;
        println!("Stopped {}", style(&state.name).cyan());
    }
    Ok(())
}
