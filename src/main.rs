use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod images;
mod lock;
mod search;
mod storage;
#[cfg(test)]
mod tests;

use cli::{Command, QueryArgs};
use config::Config;
use lock::WriterLock;
use search::engine::EngineError;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // MMSEARCH_LOG=debug mmsearch search --text "a dog on a beach"
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MMSEARCH_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    if let Err(e) = run(args) {
        match e.downcast_ref::<EngineError>() {
            Some(err) if err.is_consistency() => {
                log::error!("Vector index and image store disagree; inspect with `mmsearch check`")
            }
            Some(err) if err.is_upstream() => log::error!("A storage backend or the model failed"),
            _ => {}
        }
        return Err(e);
    }

    Ok(())
}

fn run(args: cli::Args) -> anyhow::Result<()> {
    let paths = app::AppPaths::resolve()?;
    let config = Config::load_with(&paths.base_path)?;

    // writers hold the lock for the whole command
    let _lock = match args.command {
        Command::Insert { .. } | Command::Import { .. } | Command::Delete { .. } => Some(
            WriterLock::acquire(&paths.base_path).context("Failed to lock the database")?,
        ),
        _ => None,
    };

    let engine = app::open_engine(&config)?;

    match args.command {
        Command::Insert { path, raw } => {
            let id = match raw.as_deref() {
                Some(&[height, width]) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    engine.insert_image_raw(&[height, width, images::CHANNELS], bytes)?
                }
                Some(_) => bail!("--raw takes HEIGHT,WIDTH"),
                None => {
                    let image = images::load_image(&path)
                        .with_context(|| format!("Failed to load {}", path.display()))?;
                    engine.insert_image(&image)?
                }
            };
            print_json(&serde_json::json!({ "id": id, "uri": engine.get_image_uri(id)? }))
        }

        Command::Import { dir, no_progress } => {
            let progress = app::import_progress_bar(no_progress);
            let report = app::import_dir(&engine, &dir, &progress)?;
            log::info!(
                "Imported {} images, skipped {}",
                report.inserted.len(),
                report.skipped.len()
            );
            print_json(&report)
        }

        Command::Delete { entry } => {
            let id = match entry.parse::<u64>() {
                Ok(id) => id,
                Err(_) => engine.id_for_uri(&entry)?,
            };
            engine.delete_image(id)?;
            println!("entry {id} removed");
            Ok(())
        }

        Command::Search {
            query: QueryArgs { image, text },
            top_k,
            threshold,
            ids,
        } => {
            let top_k = top_k.unwrap_or(config.search.top_k);

            let results = match (image, text) {
                (Some(path), _) => {
                    let image = images::load_image(&path)
                        .with_context(|| format!("Failed to load {}", path.display()))?;
                    match threshold {
                        Some(threshold) => {
                            engine.search_with_image_threshold(&image, top_k, threshold)?
                        }
                        None => engine.search_with_image(&image, top_k)?,
                    }
                }
                (None, Some(text)) => {
                    if threshold.is_some() {
                        log::warn!("--threshold only applies to image queries");
                    }
                    engine.search_with_text(&text, top_k)?
                }
                (None, None) => bail!("either --image or --text is required"),
            };

            if ids {
                print_json(&results)
            } else {
                print_json(&engine.resolve_uris(&results)?)
            }
        }

        Command::Get { id, output } => {
            match output {
                Some(output) => {
                    let png = engine.get_image(id)?.encode_png()?;
                    std::fs::write(&output, png)
                        .with_context(|| format!("Failed to write {}", output.display()))?;
                }
                None => println!("{}", engine.get_image_uri(id)?),
            }
            Ok(())
        }

        Command::List {} => {
            let entries: Vec<serde_json::Value> = engine
                .entries()?
                .into_iter()
                .map(|(id, uri)| serde_json::json!({ "id": id, "uri": uri }))
                .collect();
            print_json(&entries)
        }

        Command::Check {} => {
            engine.check_consistency()?;
            println!(
                "ok: {} entries in sync (model {})",
                engine.size()?,
                engine.model_id()
            );
            Ok(())
        }
    }
}
