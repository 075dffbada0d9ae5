//! Evanesco
//!
//! Hides top-level windows of other processes from screen capture by
//! running `SetWindowDisplayAffinity` inside the process that owns them,
//! either as a small injected payload or through a hook library.

pub mod autohide;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod exports;
pub mod hider;
pub mod loader;
pub mod matcher;
pub mod payload;
#[cfg(target_os = "windows")]
pub mod platform;
pub mod procinfo;
pub mod resolver;
pub mod target;
pub mod watcher;

use log::{error, info};
use std::process::ExitCode;

pub use config::Settings;
pub use error::{HideError, HideResult};
pub use events::{AppEvent, EmitAppEvent};
pub use hider::{HidePlatform, Hider, WindowHider};
pub use target::{Architecture, ResolvedTarget, Target, WindowHandle};

pub fn main() -> ExitCode {
    use clap::Parser;

    let cli = cli::Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli::default_log_filter(cli.quiet)),
    )
    .init();

    info!(
        "[main] Starting Evanesco v{} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    match cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[main] {}", e);
            ExitCode::FAILURE
        }
    }
}
