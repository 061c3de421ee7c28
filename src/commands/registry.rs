use std::path::Path;

use chrono::Utc;

use crate::config::MeshConfig;
use crate::error::Result;
use crate::output::{self, Format, RegistryEntry};

pub fn run(db: &Path, config: &MeshConfig, format: Format) -> Result<()> {
    let channel = super::open_channel(db, config)?;
    let now = Utc::now();
    let entries: Vec<RegistryEntry> = channel
        .list_tabs()?
        .into_iter()
        .map(|descriptor| RegistryEntry {
            alive: descriptor.is_alive(now, config.liveness_timeout_ms),
            silent_ms: descriptor.silence_ms(now),
            descriptor,
        })
        .collect();
    output::print_registry(&entries, format)
}
