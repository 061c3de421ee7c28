use std::path::Path;
use std::thread;

use crate::config::MeshConfig;
use crate::election::Transition;
use crate::error::Result;
use crate::identity::TabIdentity;
use crate::model::Role;
use crate::output::{self, Format};
use crate::protocol::LoopbackClient;
use crate::tab::Tab;

/// Run one tab against the channel at `db` until `ticks` rounds have passed
/// (forever when `None`), printing every round that changed something.
pub fn run(
    db: &Path,
    session_dir: Option<&Path>,
    ticks: Option<u64>,
    config: &MeshConfig,
    format: Format,
) -> Result<()> {
    let channel = super::open_channel(db, config)?;
    let identity = match session_dir {
        Some(dir) => TabIdentity::open(dir)?,
        None => TabIdentity::ephemeral(),
    };
    let (client, _handle) = LoopbackClient::new();
    let mut tab = Tab::open(identity, channel, Box::new(client), *config)?;
    tracing::info!(tab = %tab.id(), db = %db.display(), "tab running");

    let mut last_role: Option<Role> = None;
    let mut rounds = 0u64;
    loop {
        let report = tab.tick();
        let changed = last_role != Some(report.role)
            || report.transition != Transition::Unchanged
            || report.adopted > 0
            || !report.executed.is_empty();
        if changed {
            output::print_tick(&report, format)?;
        }
        last_role = Some(report.role);

        rounds += 1;
        if ticks.is_some_and(|limit| rounds >= limit) {
            break;
        }
        thread::sleep(config.heartbeat_interval());
    }

    tab.close();
    Ok(())
}
