//! Command-line front end.

use crate::config::{AutohideSettings, InjectionMethod, Settings};
use crate::error::{HideError, HideResult};
use crate::hider::WindowHider;
use crate::procinfo;
use crate::target::{Target, WindowHandle};
use clap::{ArgGroup, Args, Parser, Subcommand};
use log::warn;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "evanesco", version, about = "Hide windows from screen capture")]
pub struct Cli {
    /// Settings file (JSON). Defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Exclude a window from screen capture.
    Hide(TargetArgs),
    /// Make a hidden window capturable again.
    Unhide(TargetArgs),
    /// Hide matching processes as they start, until Enter is pressed.
    Watch,
    /// List running processes and whether they have a main window.
    List,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["process", "window"])))]
pub struct TargetArgs {
    /// Process id; its main window is used.
    #[arg(long, value_name = "PID")]
    pub process: Option<u32>,

    /// Window handle in hex (`0x1A2B` or `1A2B`).
    #[arg(long, value_name = "HEX")]
    pub window: Option<WindowHandle>,

    #[arg(long, value_enum)]
    pub method: Option<InjectionMethod>,

    /// Also toggle the target's taskbar icon.
    #[arg(long)]
    pub hide_taskbar_icon: bool,
}

impl TargetArgs {
    pub fn target(&self) -> HideResult<Target> {
        match (self.process, self.window) {
            (Some(pid), None) => Ok(Target::Process(pid)),
            (None, Some(window)) => Ok(Target::Window(window)),
            _ => Err(HideError::ConfigInvalid(
                "exactly one of --process or --window is required".into(),
            )),
        }
    }

    /// Command-line options override the settings file.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(method) = self.method {
            settings.injection_method = method;
        }
        if self.hide_taskbar_icon {
            settings.hide_target_taskbar_icons = true;
        }
    }
}

pub fn default_log_filter(quiet: bool) -> &'static str {
    if quiet {
        "warn"
    } else {
        "info"
    }
}

pub fn run(cli: Cli) -> HideResult<()> {
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Hide(args) => {
            args.apply_to(&mut settings);
            let resolved = WindowHider::new(settings)?.hide(args.target()?)?;
            println!("Hidden window {} of process {}", resolved.window, resolved.pid);
            Ok(())
        }
        Command::Unhide(args) => {
            args.apply_to(&mut settings);
            let resolved = WindowHider::new(settings)?.unhide(args.target()?)?;
            println!("Restored window {} of process {}", resolved.window, resolved.pid);
            Ok(())
        }
        Command::Watch => watch(settings),
        Command::List => {
            list();
            Ok(())
        }
    }
}

#[cfg(target_os = "windows")]
fn has_main_window() -> impl Fn(u32) -> Option<bool> {
    use crate::platform::window::Win32Windows;
    use crate::resolver::TargetResolver;

    let resolver = TargetResolver::new(Win32Windows);
    move |pid| Some(resolver.find_main_window(pid).is_some())
}

#[cfg(not(target_os = "windows"))]
fn has_main_window() -> impl Fn(u32) -> Option<bool> {
    |_| None
}

fn list() {
    let window = has_main_window();
    println!("{:>7}  {:<6}  NAME", "PID", "WINDOW");
    for process in procinfo::running_processes()
        .into_iter()
        .filter(|p| p.pid > procinfo::MAX_SYSTEM_PID)
    {
        let marker = match window(process.pid) {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        println!("{:>7}  {:<6}  {}", process.pid, marker, process.name);
    }
}

/// `watch` only runs with autohide enabled; an empty list is allowed but
/// hides nothing.
fn check_watch_settings(autohide: &AutohideSettings) -> HideResult<()> {
    if !autohide.enabled {
        return Err(HideError::ConfigInvalid(
            "autohide is disabled; set autohide.enabled to watch for processes".into(),
        ));
    }
    if autohide.list.is_empty() {
        warn!("[cli] The autohide list is empty; nothing will be hidden");
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn watch(settings: Settings) -> HideResult<()> {
    use crate::autohide::Autohider;
    use crate::events::LogEmitter;
    use crate::platform::window::Win32Windows;
    use crate::platform::wmi::WmiProcessSource;
    use crate::resolver::TargetResolver;
    use crate::watcher::ProcessWatcher;
    use log::info;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    check_watch_settings(&settings.autohide)?;

    let autohide = settings.autohide.clone();
    let grace = Duration::from_millis(settings.watcher_grace_ms);
    let hider = WindowHider::new(settings)?;
    let autohider = Arc::new(Autohider::new(
        hider,
        TargetResolver::new(Win32Windows),
        LogEmitter,
        &autohide,
    ));

    if autohide.hide_existing_on_start {
        autohider.hide_existing(&procinfo::running_processes());
    }

    let (tx, rx) = mpsc::channel();
    let _dispatcher = autohider.spawn_dispatcher(rx)?;
    let mut watcher = ProcessWatcher::new(WmiProcessSource, tx, grace)?;
    watcher.start()?;

    println!("Watching for new processes. Press Enter to stop.");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    watcher.stop();
    info!("[cli] Watch ended");
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn watch(settings: Settings) -> HideResult<()> {
    check_watch_settings(&settings.autohide)?;
    warn!("[cli] Process watching is only available on Windows");
    Err(HideError::Unsupported("process watching requires Windows"))
}
