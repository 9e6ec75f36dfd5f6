use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Editor, Helper};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crucible::bridge::Bridge;
use crucible::config::Config;
use crucible::host::{IdleScheduler, QueueScheduler, Sink};
use crucible::interpreter::Execution;

/// Crucible - an interactive console host for Lua plugin modules
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Additional plugin directories to scan for *.lua modules
    #[arg(short, long)]
    plugin_dir: Vec<PathBuf>,
}

/// Line-editor glue: completion requests go straight to the bridge
struct ConsoleHelper {
    bridge: Bridge,
}

impl Completer for ConsoleHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let completions = self.bridge.complete(&line[..pos]);
        let candidates = completions
            .into_iter()
            .map(|completion| Pair {
                display: completion.display,
                replacement: completion.inserted,
            })
            .collect();
        // Replacement text carries the full line prefix.
        Ok((0, candidates))
    }
}

impl Hinter for ConsoleHelper {
    type Hint = String;
}

impl Highlighter for ConsoleHelper {}
impl Validator for ConsoleHelper {}
impl Helper for ConsoleHelper {}

fn main() -> Result<()> {
    let args = Args::parse();

    // Log to stderr so console output stays clean on stdout.
    let log_level = if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    let config = if let Some(config_path) = &args.config {
        Config::load_from_file(config_path)?
    } else {
        Config::load_default()?
    };

    let scheduler = Arc::new(QueueScheduler::new());
    let out: Sink = Arc::new(|text: &str| {
        print!("{text}");
        let _ = std::io::stdout().flush();
    });
    let err: Sink = Arc::new(|text: &str| {
        eprint!("{text}");
    });

    let bridge = Bridge::new(
        "crucible",
        Arc::clone(&scheduler) as Arc<dyn IdleScheduler>,
        out,
        err,
    )?;

    for capability in &config.plugins.capabilities {
        bridge.register_capability(&capability.name, capability.parent.as_deref())?;
    }

    let mut plugin_dirs = config.plugins.dirs.clone();
    plugin_dirs.extend(args.plugin_dir.iter().cloned());
    for dir in &plugin_dirs {
        load_plugins_from(&bridge, dir);
    }

    run_console(&bridge, &scheduler, &config)?;

    bridge.all_plugins_unloaded()?;
    bridge.shutdown()?;
    Ok(())
}

/// Load every `*.lua` module in `dir` under its file stem
fn load_plugins_from(bridge: &Bridge, dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "cannot scan plugin directory: {e}");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lua") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        match bridge.load(&path, dir, name) {
            Ok(_) => info!(plugin = name, "plugin module loaded"),
            Err(e) => warn!(plugin = name, "plugin load failed: {e}"),
        }
    }
}

fn run_console(bridge: &Bridge, scheduler: &QueueScheduler, config: &Config) -> Result<()> {
    let mut editor: Editor<ConsoleHelper, DefaultHistory> =
        Editor::new().context("Failed to initialize line editor")?;
    editor.set_helper(Some(ConsoleHelper {
        bridge: bridge.clone(),
    }));

    let history_path = config.history_path().ok();
    if config.console.history {
        if let Some(path) = &history_path {
            // Missing history is normal on first run.
            let _ = editor.load_history(path);
        }
    }

    loop {
        // The console is the host's main loop; between lines it is idle,
        // which is when deferred collections run.
        scheduler.drain();

        match editor.readline(&bridge.prompt()) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                match bridge.execute(&line) {
                    Ok(Execution::Complete { .. }) | Ok(Execution::AwaitingMore) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C discards any half-entered block.
                bridge.reset_console()?;
                println!("^C");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("Line editor failure"),
        }
    }

    if config.console.history {
        if let Some(path) = &history_path {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Err(e) = editor.save_history(path) {
                warn!("could not save console history: {e}");
            }
        }
    }

    Ok(())
}
