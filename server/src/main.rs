//! Standalone ttymux daemon binary. Run with --home <dir>, or use the default
//! home dir ($TTYMUX_HOME, else ~/.ttymux).

use std::path::PathBuf;

use common::config;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut home: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--home" && i + 1 < args.len() {
            home = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }

    let home_dir = home.unwrap_or_else(config::default_home_dir);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(server::run_daemon(home_dir))
}
