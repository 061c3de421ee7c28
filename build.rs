use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
    println!("cargo:rerun-if-env-changed=TABMESH_BUILD_GIT_SHA");

    if std::env::var_os("TABMESH_BUILD_GIT_SHA").is_some() {
        return;
    }
    if let Ok(output) = Command::new("git").args(["rev-parse", "--short=12", "HEAD"]).output()
        && output.status.success()
    {
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !sha.is_empty() {
            println!("cargo:rustc-env=TABMESH_BUILD_GIT_SHA={sha}");
        }
    }
}
