pub mod actions;
pub mod build_info;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod election;
pub mod error;
pub mod identity;
pub mod logging;
pub mod model;
pub mod output;
pub mod presence;
pub mod protocol;
pub mod replicator;
pub mod resources;
pub mod router;
pub mod state;
pub mod store;
pub mod tab;
pub mod tab_id;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use identity::TabIdentity;
pub use tab::{DispatchOutcome, Tab, TickReport};
pub use tab_id::TabId;
