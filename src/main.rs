use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod app;
mod catalog;
mod cli;
mod config;
mod definitions;
mod repository;
mod semantic;
mod storage;

use app::App;
use cli::{split_list, Command};
use config::Config;
use definitions::SemanticTypeDefinition;
use repository::BackendMode;
use semantic::{IndexState, SimilarityQuery};

/// Upper bound for waiting on background index work before a query.
const INDEX_WAIT: Duration = Duration::from_secs(30 * 60);

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    if let Err(err) = result {
        eprintln!("log system initialization failed: {err}");
    }
}

fn read_definition(path: &std::path::Path) -> anyhow::Result<SemanticTypeDefinition> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("{} is not a valid definition", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn needs_index(command: &Command) -> bool {
    matches!(command, Command::Similar { .. } | Command::Reindex { .. })
}

/// Polls index progress until the bulk pass finishes.
fn show_progress(app: &App) -> anyhow::Result<()> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    loop {
        let progress = app.indexer().progress();
        bar.set_length(progress.target as u64);
        bar.set_position((progress.completed + progress.failed) as u64);
        if progress.failed > 0 {
            bar.set_message(format!("{} failed", progress.failed));
        }

        if progress.state == IndexState::Idle {
            bar.finish_with_message(format!(
                "{} indexed, {} failed",
                progress.completed, progress.failed
            ));
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

/// Vectors kept only in memory start empty in every process; fill them
/// before answering a query.
fn ensure_index(app: &App) -> anyhow::Result<()> {
    if !app.indexer().wait_idle(INDEX_WAIT) {
        bail!("timed out waiting for background indexing");
    }

    if app.vectors().exists()? {
        return Ok(());
    }

    log::info!("vector index is empty, indexing semantic types");
    if let Some(report) = app.indexer().index_all_now(false) {
        log::info!("{} types indexed, {} failed", report.indexed, report.failed);
    }
    Ok(())
}

fn run(app: &App, command: Command) -> anyhow::Result<()> {
    let catalog = app.catalog();

    match command {
        Command::Add {
            file,
            name,
            description,
            values,
            pattern,
            priority,
        } => {
            let mut def = match (file, name) {
                (Some(path), _) => read_definition(&path)?,
                (None, Some(name)) => match (values, pattern) {
                    (Some(values), _) => {
                        let values = split_list(&values);
                        let values: Vec<&str> = values.iter().map(String::as_str).collect();
                        SemanticTypeDefinition::list(&name, &description, &values)
                    }
                    (None, Some(pattern)) => {
                        SemanticTypeDefinition::regex(&name, &description, &pattern)
                    }
                    (None, None) => bail!("either --values or --pattern is required"),
                },
                (None, None) => bail!("either --file or --name is required"),
            };
            if priority.is_some() {
                def.priority = priority;
            }

            let saved = catalog.add(def)?;
            print_json(&saved)
        }

        Command::Update { name, file } => {
            let def = read_definition(&file)?;
            match catalog.update(&name, def)? {
                Some(updated) => print_json(&updated),
                None => bail!("semantic type {name} not found"),
            }
        }

        Command::Remove { name } => {
            if !catalog.remove(&name)? {
                bail!("semantic type {name} not found");
            }
            println!("removed {name}");
            Ok(())
        }

        Command::Show { name } => match catalog.get(&name)? {
            Some(def) => print_json(&def),
            None => bail!("semantic type {name} not found"),
        },

        Command::List { custom, short } => {
            let defs = if custom {
                catalog.list_custom()?
            } else {
                catalog.list_all()?
            };

            if short {
                for def in &defs {
                    let origin = if def.is_built_in { "built-in" } else { "custom" };
                    println!("{}\t{}\t{origin}", def.name, def.plugin.kind());
                }
                return Ok(());
            }
            print_json(&defs)
        }

        Command::Similar {
            description,
            like,
            examples,
            headers,
            threshold,
            disambiguate,
            best,
        } => {
            ensure_index(app)?;

            let query = match (&like, description) {
                (Some(name), _) => match catalog.get(name)? {
                    Some(def) => SimilarityQuery::from_definition(&def),
                    None => bail!("semantic type {name} not found"),
                },
                (None, Some(description)) => {
                    let examples = examples.as_deref().map(split_list).unwrap_or_default();
                    let headers = headers.as_deref().map(split_list).unwrap_or_default();
                    SimilarityQuery::new(&description)
                        .with_examples(&examples.iter().map(String::as_str).collect::<Vec<_>>())
                        .with_headers(&headers.iter().map(String::as_str).collect::<Vec<_>>())
                }
                (None, None) => bail!("either a description or --like is required"),
            };

            let search = app.search();
            let threshold = threshold.unwrap_or(search.default_threshold());
            if !(0.0..=1.0).contains(&threshold) {
                bail!("threshold must be between 0.0 and 1.0");
            }

            if best {
                return print_json(&search.find_most_similar(&query)?);
            }
            let mut matches = if disambiguate {
                search.find_top_for_disambiguation(&query, threshold)?
            } else {
                search.find_similar(&query, threshold)?
            };
            if let Some(name) = &like {
                matches.retain(|m| &m.semantic_type != name);
            }
            print_json(&matches)
        }

        Command::Reindex { full } => {
            if !app.indexer().wait_idle(INDEX_WAIT) {
                bail!("timed out waiting for background indexing");
            }

            let started = if full {
                app.indexer().rebuild_all()
            } else {
                app.indexer().on_connectivity_established()
            };
            if !started {
                bail!("indexing is already in progress");
            }
            show_progress(app)?;

            if !app.vectors().is_durable() {
                log::warn!("vectors are kept in memory only and are discarded on exit");
            }
            Ok(())
        }

        Command::Sync {} => {
            let count = catalog.reload()?;
            println!("{count} stored definitions ({})", app.repository().mode());
            Ok(())
        }

        Command::Disconnect {} => {
            if app.repository().mode() != BackendMode::Remote {
                bail!("not connected to a remote store");
            }
            app.disconnect();
            println!("switched to {}", app.repository().mode());
            Ok(())
        }

        Command::Status {} => print_json(&app.status()?),
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let base_path = app::base_path()?;
    let config = Config::load_with(&base_path)
        .with_context(|| format!("failed to load config from {}", base_path.display()))?;
    let app = App::new(config)?;

    if app.config().remote.enabled && !args.offline {
        let connector = app::connector_from_config(app.config())?;
        let mode = app.connect(connector.as_ref(), needs_index(&args.command));
        log::info!("definitions storage: {mode}");
    }

    let span = tracing::info_span!("command", offline = args.offline);
    let result = span.in_scope(|| run(&app, args.command));

    app.shutdown();
    result
}
