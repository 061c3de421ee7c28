use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tabmesh::config::MeshConfig;
use tabmesh::output::Format;

#[derive(Parser)]
#[command(
    name = "tabmesh",
    version,
    about = "Coordinate the tabs of one messaging session: one master, shared state, gated actions"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Log at debug level (TABMESH_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,
    /// YAML file with timing and retry settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one tab against a shared channel
    Tab {
        /// SQLite channel file shared by every tab of the session
        #[arg(long)]
        db: PathBuf,
        /// Directory private to this tab; keeps its id across restarts
        #[arg(long)]
        session_dir: Option<PathBuf>,
        /// Stop after this many heartbeat rounds
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// List registered tabs and their liveness
    Registry {
        #[arg(long)]
        db: PathBuf,
    },
    /// Dispatch one action from a short-lived tab
    Dispatch {
        #[arg(long)]
        db: PathBuf,
        /// Action name, e.g. call.join
        action: String,
        /// JSON payload
        payload: Option<String>,
    },
    /// Print the latest replicated state snapshot
    State {
        #[arg(long)]
        db: PathBuf,
    },
    /// Remove dead tab descriptors
    Prune {
        #[arg(long)]
        db: PathBuf,
    },
    /// Print version and build commit
    Version,
}

fn run(cli: Cli, format: Format) -> tabmesh::Result<()> {
    let config = MeshConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Tab {
            db,
            session_dir,
            ticks,
        } => tabmesh::commands::tab::run(&db, session_dir.as_deref(), ticks, &config, format),
        Commands::Registry { db } => tabmesh::commands::registry::run(&db, &config, format),
        Commands::Dispatch {
            db,
            action,
            payload,
        } => tabmesh::commands::dispatch::run(&db, &action, payload.as_deref(), &config, format),
        Commands::State { db } => tabmesh::commands::state::run(&db, &config, format),
        Commands::Prune { db } => tabmesh::commands::prune::run(&db, &config, format),
        Commands::Version => tabmesh::commands::version::run(format),
    }
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = tabmesh::logging::init(cli.verbose) {
        eprintln!("warning: {e}");
    }
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn dispatch_takes_optional_payload() {
        let cli = Cli::try_parse_from(["tabmesh", "dispatch", "--db", "x.db", "call.leave"]).unwrap();
        match cli.command {
            Commands::Dispatch { action, payload, .. } => {
                assert_eq!(action, "call.leave");
                assert!(payload.is_none());
            }
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn pretty_flag_is_global() {
        let cli = Cli::try_parse_from(["tabmesh", "registry", "--db", "x.db", "--pretty"]).unwrap();
        assert!(cli.pretty);
    }
}
