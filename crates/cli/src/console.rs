//! Interactive confirmation gate on the terminal.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use history::Proposal;
use runtime::{ConfirmationOutcome, Interaction, Operator, describe_proposal};
use serde_json::{Value, json};
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Exclusive use of stdout.
///
/// Held by the operator for the whole of a prompt and by the event printer
/// for each event, so session updates queue behind an open question.
#[derive(Debug, Clone, Default)]
pub struct Terminal {
    lock: Arc<Mutex<()>>,
}

impl Terminal {
    pub async fn hold(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

/// Operator that asks the person at the terminal.
///
/// Stdin is read on the blocking pool so the session task never stalls
/// the runtime. End of input is taken as an abort.
#[derive(Debug, Clone, Default)]
pub struct ConsoleOperator {
    terminal: Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Yes,
    Redo,
    Abort,
}

fn parse_choice(input: &str) -> Option<Choice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "c" | "confirm" => Some(Choice::Yes),
        "r" | "redo" | "n" | "no" | "reject" => Some(Choice::Redo),
        "a" | "abort" | "q" | "quit" => Some(Choice::Abort),
        _ => None,
    }
}

/// Print `prompt` and read one line. `None` on end of input.
fn read_line(prompt: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(prompt.as_bytes())?;
    stdout.flush()?;
    drop(stdout);

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn ask(prompt: String) -> io::Result<Option<String>> {
    tokio::task::spawn_blocking(move || read_line(&prompt))
        .await
        .map_err(io::Error::other)?
}

/// Keep asking until the answer parses.
async fn ask_choice(prompt: &str) -> io::Result<Option<Choice>> {
    loop {
        let Some(answer) = ask(prompt.to_string()).await? else {
            return Ok(None);
        };
        if let Some(choice) = parse_choice(&answer) {
            return Ok(Some(choice));
        }
        println!("Please answer y, r, or a.");
    }
}

impl ConsoleOperator {
    pub fn new(terminal: Terminal) -> Self {
        Self { terminal }
    }

    async fn confirm_inner(&self, proposal: &Proposal) -> io::Result<ConfirmationOutcome> {
        let _terminal = self.terminal.hold().await;
        println!("\n--- Proposed next step ---\n{}", describe_proposal(proposal));
        match ask_choice("[y]es / [r]edo / [a]bort: ").await? {
            Some(Choice::Yes) => Ok(ConfirmationOutcome::Confirm),
            Some(Choice::Redo) => {
                let feedback = ask("What should change? ".to_string()).await?;
                Ok(ConfirmationOutcome::redo(feedback.unwrap_or_default()))
            }
            Some(Choice::Abort) | None => Ok(ConfirmationOutcome::Abort),
        }
    }

    async fn interact_inner(&self, interaction: &Interaction) -> io::Result<Value> {
        let _terminal = self.terminal.hold().await;
        match interaction {
            Interaction::ShowInformation { title, message } => {
                println!("\n[{title}]\n{message}");
                Ok(json!({"status": "shown"}))
            }
            Interaction::GetConfirmation {
                message,
                instructions,
            } => {
                println!("\n{message}");
                if let Some(instructions) = instructions {
                    println!("{instructions}");
                }
                match ask_choice("[y]es / [r]eject / [a]bort: ").await? {
                    Some(Choice::Yes) => Ok(json!({"choice": "confirm", "feedback": null})),
                    Some(Choice::Redo) => {
                        let feedback = ask("Why? ".to_string()).await?;
                        Ok(json!({"choice": "reject", "feedback": feedback}))
                    }
                    Some(Choice::Abort) | None => Ok(json!({"choice": "abort", "feedback": null})),
                }
            }
            Interaction::ReportError {
                message,
                error_type,
                details,
            } => {
                match error_type {
                    Some(kind) => println!("\nError ({kind}): {message}"),
                    None => println!("\nError: {message}"),
                }
                if let Some(details) = details {
                    println!("{details}");
                }
                Ok(json!({"status": "error_reported"}))
            }
            Interaction::Escalate { question, context } => {
                println!("\nQuestion: {question}");
                if let Some(context) = context {
                    println!("Context: {context}");
                }
                Ok(match ask("> ".to_string()).await? {
                    Some(answer) if !answer.trim().is_empty() => {
                        json!({"status": "answered", "answer": answer.trim()})
                    }
                    _ => json!({"status": "unanswered", "answer": null}),
                })
            }
        }
    }
}

impl Operator for ConsoleOperator {
    async fn confirm(&self, proposal: &Proposal) -> ConfirmationOutcome {
        match self.confirm_inner(proposal).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "could not read confirmation; aborting");
                ConfirmationOutcome::Abort
            }
        }
    }

    async fn interact(&self, interaction: &Interaction) -> runtime::Result<Value> {
        Ok(self.interact_inner(interaction).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_choices() {
        assert_eq!(parse_choice(""), Some(Choice::Yes));
        assert_eq!(parse_choice("Y\n"), Some(Choice::Yes));
        assert_eq!(parse_choice(" redo "), Some(Choice::Redo));
        assert_eq!(parse_choice("n"), Some(Choice::Redo));
        assert_eq!(parse_choice("A"), Some(Choice::Abort));
        assert_eq!(parse_choice("maybe"), None);
    }

    #[tokio::test]
    async fn output_waits_for_an_open_prompt() {
        let terminal = Terminal::default();
        let prompt = terminal.hold().await;

        let printer = terminal.clone();
        let (printed_tx, mut printed_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(async move {
            let _out = printer.hold().await;
            let _ = printed_tx.send(());
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(printed_rx.try_recv().is_err());

        drop(prompt);
        task.await.unwrap();
        assert!(printed_rx.try_recv().is_ok());
    }
}
