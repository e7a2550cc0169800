use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use concierge_agent::{AgentError, AgentReply, AgentRuntime};
use concierge_config::ConciergeConfig;

use crate::approvals;

/// Run the interactive chat REPL.
///
/// Input is read on a blocking thread so approvals can be answered with
/// `/approve <id>` or `/reject <id>` while a run is waiting on them.
pub async fn run_chat(config: ConciergeConfig, base_dir: PathBuf, consumer: String) -> Result<()> {
    config.consumer(&consumer)?;
    let runtime = Arc::new(AgentRuntime::from_config(config, base_dir)?);
    let mut requests = approvals::subscribe(&runtime).await;
    let mut lines = spawn_stdin_reader();
    let (done_tx, mut done) = mpsc::unbounded_channel::<Result<AgentReply, AgentError>>();

    println!("concierge chat (consumer: {consumer})");
    println!("Commands: /approve <id>, /reject <id>, /pending, /reset, exit\n");
    prompt_marker()?;

    // Cancellation handle of the run in flight, if any.
    let mut running: Option<CancellationToken> = None;
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else {
                    println!();
                    break;
                };
                let input = line.trim();
                if input == "exit" || input == "quit" {
                    break;
                }
                if let Some(command) = input.strip_prefix('/') {
                    handle_command(&runtime, &consumer, command).await;
                } else if !input.is_empty() {
                    if running.is_some() {
                        eprintln!("[busy: the previous message is still running]");
                    } else {
                        let cancel = CancellationToken::new();
                        let runtime = runtime.clone();
                        let consumer = consumer.clone();
                        let message = input.to_string();
                        let token = cancel.clone();
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let _ = done_tx.send(runtime.ask(&consumer, &message, &token).await);
                        });
                        running = Some(cancel);
                        continue;
                    }
                }
                prompt_marker()?;
            }
            Some(request) = requests.recv() => {
                eprintln!("\n{}", request.describe());
                eprintln!("Answer with /approve {0} or /reject {0}", request.request_id);
            }
            Some(result) = done.recv() => {
                running = None;
                match result {
                    Ok(reply) => {
                        println!("{}", reply.text);
                        if reply.termination.is_aborted() {
                            eprintln!("[stopped early: {}]", reply.termination.as_str());
                        }
                    }
                    Err(e) => eprintln!("[error: {e}]"),
                }
                println!();
                prompt_marker()?;
            }
        }
    }

    if let Some(cancel) = running.take() {
        cancel.cancel();
        let _ = done.recv().await;
    }
    runtime.shutdown().await;
    println!("Goodbye!");
    Ok(())
}

async fn handle_command(runtime: &Arc<AgentRuntime>, consumer: &str, command: &str) {
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(verb @ ("approve" | "reject")), Some(id)) => {
            let approved = verb == "approve";
            match runtime
                .resolve_approval(id, approved, &CancellationToken::new())
                .await
            {
                Ok(None) => eprintln!("[{} {id}]", if approved { "approved" } else { "rejected" }),
                Ok(Some(reply)) => println!("{}", reply.text),
                Err(e) => eprintln!("[error: {e}]"),
            }
        }
        (Some("pending"), _) => {
            let pending = runtime.pending_approvals().await;
            if pending.is_empty() {
                eprintln!("[no pending approvals]");
            }
            for id in pending {
                eprintln!("  {id}");
            }
        }
        (Some("reset"), _) => match runtime.reset(consumer).await {
            Ok(()) => eprintln!("[history cleared]"),
            Err(e) => eprintln!("[error: {e}]"),
        },
        _ => eprintln!("[unknown command: /{command}]"),
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt_marker() -> Result<()> {
    print!("> ");
    io::stdout().flush()?;
    Ok(())
}
