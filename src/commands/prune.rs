use std::path::Path;

use chrono::Utc;

use crate::config::MeshConfig;
use crate::error::Result;
use crate::output::{self, Format};

/// Remove descriptors that are closing or have gone silent.
pub fn run(db: &Path, config: &MeshConfig, format: Format) -> Result<()> {
    let channel = super::open_channel(db, config)?;
    let now = Utc::now();
    let mut pruned = Vec::new();
    for desc in channel.list_tabs()? {
        if !desc.is_alive(now, config.liveness_timeout_ms) && channel.remove_tab(&desc.id)? {
            tracing::debug!(tab = %desc.id, "pruned");
            pruned.push(desc.id);
        }
    }
    output::print_pruned(&pruned, format)
}
