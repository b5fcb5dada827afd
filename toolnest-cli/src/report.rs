//! Console observer for install events.
//!
//! Drains the event channel on a single consumer and prints one line per
//! status change, failure and progress decile.

use std::collections::HashMap;

use toolnest_core::installer::{EventReceiver, InstallEvent, RunSummary, Stage};

/// Prints install events until the run finishes.
#[derive(Default)]
pub struct ConsoleReporter {
    /// Last printed progress decile per tool and stage.
    printed: HashMap<(String, Stage), u32>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes events until `AllDone` and returns the run summary.
    ///
    /// Returns `None` if the channel closes first.
    pub async fn run(&mut self, rx: &mut EventReceiver) -> Option<RunSummary> {
        while let Some(event) = rx.recv().await {
            if let Some(summary) = self.handle(&event) {
                return Some(summary);
            }
        }
        None
    }

    fn handle(&mut self, event: &InstallEvent) -> Option<RunSummary> {
        match event {
            InstallEvent::Status { tool, stage } => match stage {
                Stage::Completed => println!("[{}] installed successfully", tool),
                Stage::Cancelled => println!("[{}] cancelled", tool),
                // Failures are reported with their message below.
                Stage::Failed => {}
                _ => println!("[{}] {}", tool, stage.label()),
            },
            InstallEvent::Progress {
                tool,
                stage,
                fraction,
                overall,
            } => {
                let decile = (fraction * 10.0).floor() as u32;
                let key = (tool.clone(), *stage);
                let seen = matches!(self.printed.get(&key), Some(last) if decile <= *last);
                if !seen {
                    self.printed.insert(key, decile);
                    if decile > 0 {
                        println!(
                            "[{}] {} {:>3.0}% (overall {:.0}%)",
                            tool,
                            stage.label(),
                            fraction * 100.0,
                            overall
                        );
                    }
                }
            }
            InstallEvent::Failed {
                tool,
                stage,
                message,
            } => {
                eprintln!("[{}] failed during {}: {}", tool, stage.label(), message);
            }
            InstallEvent::AllDone(summary) => return Some(*summary),
        }
        None
    }
}

/// One-line notice for the end of a run.
pub fn completion_notice(summary: &RunSummary) -> String {
    if summary.is_success() {
        format!(
            "All {} tool(s) installed. Open a new terminal to pick up the updated PATH.",
            summary.completed
        )
    } else {
        format!(
            "Finished: {} installed, {} failed, {} cancelled.",
            summary.completed, summary.failed, summary.cancelled
        )
    }
}
