use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{MeshError, Result};

pub const LOG_ENV: &str = "TABMESH_LOG";

/// `TABMESH_LOG` wins when set; otherwise `warn`, or `debug` for this crate
/// when verbose.
pub fn filter_directive(verbose: bool, env: Option<&str>) -> String {
    match env.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directive) => directive.to_string(),
        None if verbose => "warn,tabmesh=debug".to_string(),
        None => "warn".to_string(),
    }
}

/// Install the stderr subscriber. A second call is a no-op.
pub fn init(verbose: bool) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let filter = EnvFilter::try_new(filter_directive(verbose, env.as_deref()))
        .map_err(|err| MeshError::InvalidConfig(format!("{LOG_ENV}: {err}")))?;
    match fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("global default") => Ok(()),
        Err(err) => Err(MeshError::InvalidConfig(format!("logging: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_directive_wins() {
        assert_eq!(filter_directive(true, Some("tabmesh=trace")), "tabmesh=trace");
    }

    #[test]
    fn blank_env_falls_back_to_defaults() {
        assert_eq!(filter_directive(false, Some("  ")), "warn");
        assert_eq!(filter_directive(true, None), "warn,tabmesh=debug");
    }
}
