use std::path::Path;

use serde_json::Value;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::identity::TabIdentity;
use crate::model::Gate;
use crate::output::{self, Format};
use crate::protocol::LoopbackClient;
use crate::tab::Tab;

/// Join as a short-lived tab, dispatch one action, and leave.
pub fn run(
    db: &Path,
    action: &str,
    payload: Option<&str>,
    config: &MeshConfig,
    format: Format,
) -> Result<()> {
    let payload: Value = match payload {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };

    let channel = super::open_channel(db, config)?;
    let (client, _handle) = LoopbackClient::new();
    let mut tab = Tab::open(TabIdentity::ephemeral(), channel, Box::new(client), *config)?;

    let Some(gate) = tab.registry().gate(action) else {
        tab.close();
        return Err(MeshError::UnknownAction(action.to_string()));
    };

    tab.tick();
    let master = tab.known_master().filter(|m| *m != tab.id()).cloned();
    if gate == Gate::Master && master.is_none() {
        tab.close();
        return Err(MeshError::NotMaster(format!(
            "{action}: no master tab is running on {}",
            db.display()
        )));
    }

    let outcome = tab.dispatch(action, payload)?;
    tab.close();
    output::print_outcome(action, &outcome, format)
}
