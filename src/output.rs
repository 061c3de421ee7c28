use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::model::{Role, TabDescriptor};
use crate::state::StateSnapshot;
use crate::tab::{DispatchOutcome, TickReport};
use crate::tab_id::TabId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

/// One registry row with its liveness judged at print time.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub descriptor: TabDescriptor,
    pub alive: bool,
    pub silent_ms: i64,
}

fn role_label(role: Role) -> colored::ColoredString {
    match role {
        Role::Master => "master".green().bold(),
        Role::CandidateForMaster => "candidate".yellow(),
        Role::Follower => "follower".normal(),
    }
}

pub fn print_tick(report: &TickReport, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(report)?),
        Format::Pretty => {
            println!(
                "[{}] {} {} {}",
                report.tab.short().cyan(),
                role_label(report.role),
                format!("conn={}", report.connection_state).dimmed(),
                format!("tabs={} seq={}", report.live_tabs, report.applied_seq).dimmed(),
            );
            if report.single_tab {
                println!("  {}", "channel unavailable; single-tab mode".yellow());
            }
            if report.adopted > 0 {
                println!("  {} {}", "adopted:".dimmed(), report.adopted);
            }
            if !report.executed.is_empty() {
                println!("  {} {}", "ran:".dimmed(), report.executed.join(", "));
            }
        }
        Format::Minimal => println!("{} {}", report.tab, report.role),
    }
    Ok(())
}

pub fn print_registry(entries: &[RegistryEntry], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(entries)?),
        Format::Pretty => {
            if entries.is_empty() {
                println!("{}", "No tabs registered.".dimmed());
            }
            for entry in entries {
                let d = &entry.descriptor;
                let status = if !entry.alive {
                    "dead".red()
                } else if d.is_master {
                    "master".green().bold()
                } else {
                    "follower".normal()
                };
                println!(
                    "{} {} {}",
                    format!("[{}]", d.id).cyan().bold(),
                    status,
                    format!("silent={}ms", entry.silent_ms).dimmed(),
                );
                println!("  {} {}", "started:".dimmed(), d.started_at.to_rfc3339());
            }
        }
        Format::Minimal => {
            println!("{:16} {:8} {:>8}", "ID", "ROLE", "SILENT");
            println!("{}", "-".repeat(34));
            for entry in entries {
                let role = match (entry.alive, entry.descriptor.is_master) {
                    (false, _) => "dead",
                    (true, true) => "master",
                    (true, false) => "follower",
                };
                println!("{:16} {:8} {:>8}", entry.descriptor.id, role, entry.silent_ms);
            }
        }
    }
    Ok(())
}

pub fn print_outcome(action: &str, outcome: &DispatchOutcome, format: Format) -> Result<()> {
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({ "action": action, "result": outcome })
        ),
        Format::Pretty => match outcome {
            DispatchOutcome::Ran => println!("Ran '{}'", action.cyan()),
            DispatchOutcome::Failed { reason } => {
                println!("'{}' {}: {}", action.cyan(), "failed".red(), reason)
            }
            DispatchOutcome::Deferred => {
                println!("Deferred '{}' until the connection is ready", action.cyan())
            }
            DispatchOutcome::Forwarded { master } => {
                println!("Forwarded '{}' to master {}", action.cyan(), master.short().bold())
            }
            DispatchOutcome::Parked => {
                println!("Parked '{}'; no master yet, election started", action.cyan())
            }
        },
        Format::Minimal => {
            let label = match outcome {
                DispatchOutcome::Ran => "ran",
                DispatchOutcome::Failed { .. } => "failed",
                DispatchOutcome::Deferred => "deferred",
                DispatchOutcome::Forwarded { .. } => "forwarded",
                DispatchOutcome::Parked => "parked",
            };
            println!("{label}");
        }
    }
    Ok(())
}

pub fn print_snapshot(snapshot: Option<&StateSnapshot>, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(&snapshot)?),
        Format::Pretty => {
            let Some(snap) = snapshot else {
                println!("{}", "No state published yet.".dimmed());
                return Ok(());
            };
            let state = &snap.state;
            println!(
                "seq {} from {}",
                snap.seq.to_string().bold(),
                snap.origin.short().cyan()
            );
            println!("  {} {}", "connection:".dimmed(), state.connection_state);
            if let Some(user) = &state.current_user_id {
                println!("  {} {}", "user:".dimmed(), user);
            }
            if let Some(call) = &state.active_call_id {
                println!("  {} {}", "call:".dimmed(), call.green());
            }
            println!(
                "  {} {} chats, {} users, {} messages",
                "data:".dimmed(),
                state.chats.len(),
                state.users.len(),
                state.messages.values().map(Vec::len).sum::<usize>(),
            );
        }
        Format::Minimal => match snapshot {
            Some(snap) => println!("{} {}", snap.seq, snap.state.connection_state),
            None => println!("-"),
        },
    }
    Ok(())
}

pub fn print_pruned(pruned: &[TabId], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::json!({ "pruned": pruned })),
        Format::Pretty => {
            if pruned.is_empty() {
                println!("{}", "Nothing to prune.".dimmed());
            } else {
                for id in pruned {
                    println!("Pruned {}", id.as_str().red());
                }
            }
        }
        Format::Minimal => {
            for id in pruned {
                println!("{id}");
            }
        }
    }
    Ok(())
}
