pub mod dispatch;
pub mod prune;
pub mod registry;
pub mod state;
pub mod tab;
pub mod version;

use std::path::Path;
use std::rc::Rc;

use crate::config::MeshConfig;
use crate::error::Result;
use crate::store::{Channel, SqliteChannel};

pub(crate) fn open_channel(db: &Path, config: &MeshConfig) -> Result<Rc<dyn Channel>> {
    Ok(Rc::new(SqliteChannel::open(db, config.delta_log_capacity)?))
}
