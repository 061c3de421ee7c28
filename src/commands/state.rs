use std::path::Path;

use crate::config::MeshConfig;
use crate::error::Result;
use crate::output::{self, Format};

pub fn run(db: &Path, config: &MeshConfig, format: Format) -> Result<()> {
    let channel = super::open_channel(db, config)?;
    let snapshot = channel.snapshot()?;
    output::print_snapshot(snapshot.as_ref(), format)
}
