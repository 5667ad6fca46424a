use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use tokenmap::{
    cli::{Cli, OutputFormat},
    EstimateTokenizer, FileFilter, FileWatcher, FlatEntry, Maintenance, SharedTree,
    TiktokenTokenizer, TokenCountManager, TokenMapConfig, Tokenizer, TreeBuilder, ViewState,
};

/// How often the live loop checks the change signal
const FRAME: Duration = Duration::from_millis(100);

/// Upper bound for counting everything in `--once` mode
const ONCE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Serialize)]
struct Snapshot<'a> {
    root: &'a Path,
    total_tokens: usize,
    entries: &'a [FlatEntry],
}

#[derive(Serialize)]
struct Summary {
    total_tokens: usize,
    selected_files: usize,
}

struct Engine {
    shared: Arc<SharedTree>,
    filter: Arc<FileFilter>,
    tokens: Arc<TokenCountManager>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let mut config = TokenMapConfig::load_or_default(cli.config.as_deref())?;
    cli.apply_to(&mut config);
    if let Err(err) = config.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    let root = cli.get_watch_path();
    let root = root.canonicalize().unwrap_or(root);
    tracing::info!("Starting tokenmap on: {}", root.display());

    let engine = Engine {
        shared: SharedTree::new(&root),
        filter: Arc::new(FileFilter::new(&config.filter)),
        tokens: Arc::new(TokenCountManager::new(tokenizer(cli.estimate), &config.tokens)),
    };

    TreeBuilder::new(engine.shared.clone(), engine.filter.clone(), engine.tokens.clone())
        .with_config(&config.builder)
        .build();
    if let Some(path) = &cli.state {
        restore_view_state(&engine.shared, path);
    }

    let result = if cli.once {
        run_once(&engine, &config, cli.output)
    } else {
        run_live(&engine, &config, cli.output)
    };

    engine.tokens.stop();
    if let Some(path) = &cli.state {
        save_view_state(&engine.shared, path)?;
    }
    result
}

fn tokenizer(estimate: bool) -> Arc<dyn Tokenizer> {
    if estimate {
        return Arc::new(EstimateTokenizer);
    }
    match TiktokenTokenizer::new() {
        Ok(bpe) => Arc::new(bpe),
        Err(err) => {
            tracing::warn!("{:#}; falling back to estimated counts", err);
            Arc::new(EstimateTokenizer)
        }
    }
}

fn run_once(engine: &Engine, config: &TokenMapConfig, output: OutputFormat) -> Result<()> {
    let maintenance = Maintenance::new(
        engine.shared.clone(),
        engine.filter.clone(),
        engine.tokens.clone(),
        &config.maintenance,
    );
    if !maintenance.backfill_all(ONCE_TIMEOUT) {
        tracing::warn!("Token counting did not finish in time; printing partial counts");
    }
    print_snapshot(&engine.shared, output)
}

fn run_live(engine: &Engine, config: &TokenMapConfig, output: OutputFormat) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let watcher = FileWatcher::new(
        engine.shared.clone(),
        engine.filter.clone(),
        engine.tokens.clone(),
        &config.watcher,
    )?
    .spawn(stop.clone())
    .context("Failed to start watcher thread")?;
    let maintenance = Maintenance::new(
        engine.shared.clone(),
        engine.filter.clone(),
        engine.tokens.clone(),
        &config.maintenance,
    )
    .spawn(stop.clone())
    .context("Failed to start maintenance thread")?;

    eprintln!("Watching: {}", engine.shared.root_path().display());
    eprintln!("Press Ctrl+C to quit");

    let mut result = print_snapshot(&engine.shared, output);
    while result.is_ok() && running.load(Ordering::SeqCst) {
        if engine.shared.changed().take() {
            result = print_summary(&engine.shared, output);
        }
        thread::sleep(FRAME);
    }

    stop.store(true, Ordering::Release);
    for (name, handle) in [("watcher", watcher), ("maintenance", maintenance)] {
        if handle.join().is_err() {
            tracing::error!("The {} thread panicked", name);
        }
    }
    result
}

fn print_snapshot(shared: &SharedTree, output: OutputFormat) -> Result<()> {
    let (entries, total) = {
        let tree = shared.lock();
        (tree.flatten(), tree[tree.root()].token_count)
    };

    match output {
        OutputFormat::Text => {
            for entry in &entries {
                print_text_entry(entry);
            }
            println!();
        }
        OutputFormat::Json => {
            let snapshot = Snapshot {
                root: shared.root_path(),
                total_tokens: total,
                entries: &entries,
            };
            println!("{}", serde_json::to_string(&snapshot)?);
        }
        OutputFormat::Compact => {
            for entry in &entries {
                let path = match entry.path.strip_prefix(shared.root_path()) {
                    Ok(rel) if rel.as_os_str().is_empty() => Path::new("."),
                    Ok(rel) => rel,
                    Err(_) => entry.path.as_path(),
                };
                if entry.show_tokens {
                    println!("{}\t{}", entry.token_count, path.display());
                } else {
                    println!("-\t{}", path.display());
                }
            }
        }
    }
    Ok(())
}

fn print_summary(shared: &SharedTree, output: OutputFormat) -> Result<()> {
    let summary = {
        let tree = shared.lock();
        Summary {
            total_tokens: tree[tree.root()].token_count,
            selected_files: tree.selected_files().len(),
        }
    };

    match output {
        OutputFormat::Text => println!(
            "{} tokens in {} selected files",
            summary.total_tokens, summary.selected_files
        ),
        OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
        OutputFormat::Compact => println!("{}\t{}", summary.total_tokens, summary.selected_files),
    }
    Ok(())
}

fn print_text_entry(entry: &FlatEntry) {
    let indent = "  ".repeat(entry.depth);
    let marker = match (entry.is_dir, entry.expanded, entry.disabled) {
        (true, true, _) => "v ",
        (true, false, _) => "> ",
        (false, _, true) => "x ",
        (false, _, false) => "  ",
    };
    let suffix = if entry.is_dir { "/" } else { "" };

    if entry.show_tokens {
        println!("{}{}{}{} ({} tokens)", indent, marker, entry.name, suffix, entry.token_count);
    } else {
        println!("{}{}{}{}", indent, marker, entry.name, suffix);
    }
}

fn restore_view_state(shared: &SharedTree, path: &Path) {
    if !path.exists() {
        return;
    }
    let state = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read view state {}", path.display()))
        .and_then(|text| {
            serde_json::from_str::<ViewState>(&text)
                .with_context(|| format!("Failed to parse view state {}", path.display()))
        });

    match state {
        Ok(state) => {
            let applied = shared.lock().apply_view_state(&state);
            tracing::debug!("Restored {} view flags from {}", applied, path.display());
        }
        Err(err) => tracing::warn!("{:#}", err),
    }
}

fn save_view_state(shared: &SharedTree, path: &Path) -> Result<()> {
    let state = shared.lock().view_state();
    let text = serde_json::to_string_pretty(&state)?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write view state {}", path.display()))
}
