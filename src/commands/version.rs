use colored::Colorize;

use crate::build_info;
use crate::error::Result;
use crate::output::Format;

pub fn run(format: Format) -> Result<()> {
    let version = build_info::version();
    let sha = build_info::git_sha();
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({ "version": version, "git_sha": sha })
        ),
        Format::Pretty => match sha {
            Some(sha) => println!("tabmesh {} {}", version.bold(), format!("({sha})").dimmed()),
            None => println!("tabmesh {}", version.bold()),
        },
        Format::Minimal => println!("{version}"),
    }
    Ok(())
}
