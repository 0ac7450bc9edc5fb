//! `track-edit` - command-line front end of the track editing core

mod settings;

use clap::Parser;
use settings::{Command, Settings};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use track_edit_lib::{
    DocumentId, EditError, EditorContext, FileStore, ItemRef, Statistics, StorageError,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Edit(#[from] EditError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("Failed to open {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse GPX {}: {message}", path.display())]
    Gpx { path: PathBuf, message: String },

    #[error("`{0}` needs a persisted session (--store)")]
    NeedsStore(&'static str),
}

/// Initialize logging: fmt layer filtered by `RUST_LOG` (default `info`)
fn setup_logging() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    if std::env::var("RUST_LOG").is_err() {
        // Safety: single-threaded at startup
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}

fn open_context(settings: &Settings) -> Result<EditorContext, CliError> {
    let config = settings.config();
    match &settings.store {
        Some(path) => {
            let store = FileStore::open(Some(path.clone()))?;
            Ok(EditorContext::open(Arc::new(store), config)?)
        }
        None => Ok(EditorContext::in_memory(config)),
    }
}

fn import_file(ctx: &EditorContext, path: &Path) -> Result<DocumentId, CliError> {
    let file = File::open(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let gpx_data = gpx::read(BufReader::new(file)).map_err(|e| CliError::Gpx {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());
    let id = ctx.import_gpx(gpx_data, &name)?;
    tracing::info!("Imported {} as {}", path.display(), id);
    Ok(id)
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn print_statistics(label: &str, stats: &Statistics) {
    println!("{label}");
    println!("  distance        {:.2} km", stats.distance / 1000.0);
    println!("  points          {}", stats.point_count);
    println!("  waypoints       {}", stats.waypoint_count);
    println!(
        "  elevation       +{:.0} m / -{:.0} m",
        stats.elevation_gain, stats.elevation_loss
    );
    if let (Some(min), Some(max)) = (stats.elevation_min, stats.elevation_max) {
        println!("  altitude        {min:.0} m .. {max:.0} m");
    }
    if stats.total_time > 0.0 {
        println!(
            "  time            {} (moving {})",
            format_duration(stats.total_time),
            format_duration(stats.moving_time)
        );
    }
    if let Some(speed) = stats.moving_speed() {
        println!("  moving speed    {:.1} km/h", speed * 3.6);
    }
    if let Some(hr) = stats.heart_rate.value() {
        println!("  heart rate      {hr:.0} bpm");
    }
    if let Some(bounds) = stats.bounds {
        println!(
            "  bounds          ({:.5}, {:.5}) .. ({:.5}, {:.5})",
            bounds.min().y,
            bounds.min().x,
            bounds.max().y,
            bounds.max().x
        );
    }
}

fn run_stats(ctx: &EditorContext, files: &[PathBuf]) -> Result<(), CliError> {
    let mut imported = Vec::with_capacity(files.len());
    for path in files {
        imported.push(import_file(ctx, path)?);
    }

    for id in &imported {
        if let Some(doc) = ctx.get_document(*id) {
            let stats = ctx.statistics_for(&ItemRef::Document(*id));
            print_statistics(&format!("{} ({})", doc.metadata.name, id), &stats);
        }
    }

    if imported.len() > 1 {
        let refs: Vec<ItemRef> = imported.iter().map(|id| ItemRef::Document(*id)).collect();
        print_statistics("Total", &ctx.merge_selection(&refs));
    }
    Ok(())
}

fn run_reduce(ctx: &EditorContext, path: &Path, tolerance: f64) -> Result<(), CliError> {
    let id = import_file(ctx, path)?;
    let Some(doc) = ctx.get_document(id) else {
        return Ok(());
    };

    let mut before = 0;
    let mut after = 0;
    for (t, track) in doc.tracks.iter().enumerate() {
        for s in 0..track.segments.len() {
            let segment = ItemRef::segment(id, t, s);
            before += track.segments[s].len();
            ctx.reduce_segment(&segment, tolerance)?;
            after += ctx
                .snapshot()
                .segment(&segment)
                .map_or(0, |seg| seg.len());
        }
    }

    println!(
        "{}: {} -> {} points at {:.0} m tolerance",
        doc.metadata.name, before, after, tolerance
    );
    Ok(())
}

fn run_show(ctx: &EditorContext) {
    let snapshot = ctx.snapshot();
    let info = snapshot.info();
    println!(
        "{} documents, {} points, {} waypoints (undo: {}, redo: {})",
        info.document_count,
        info.total_points,
        info.total_waypoints,
        if ctx.can_undo() { "yes" } else { "no" },
        if ctx.can_redo() { "yes" } else { "no" },
    );
    ctx.for_each_document(|doc| {
        println!(
            "  {}  {}  {} tracks, {} points",
            doc.id(),
            doc.metadata.name,
            doc.tracks.len(),
            doc.total_points()
        );
    });
}

fn run(settings: &Settings) -> Result<(), CliError> {
    let ctx = open_context(settings)?;
    match &settings.command {
        Command::Stats { files } => run_stats(&ctx, files)?,
        Command::Reduce { file, tolerance } => run_reduce(&ctx, file, *tolerance)?,
        Command::Show => run_show(&ctx),
        Command::Undo => {
            if settings.store.is_none() {
                return Err(CliError::NeedsStore("undo"));
            }
            let done = ctx.undo()?;
            println!("{}", if done { "Undone" } else { "Nothing to undo" });
        }
        Command::Redo => {
            if settings.store.is_none() {
                return Err(CliError::NeedsStore("redo"));
            }
            let done = ctx.redo()?;
            println!("{}", if done { "Redone" } else { "Nothing to redo" });
        }
    }
    ctx.dispose();
    Ok(())
}

fn main() -> ExitCode {
    setup_logging();
    let settings = Settings::parse();
    tracing::debug!("Settings: {:?}", settings);

    match run(&settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0:00:00");
        assert_eq!(format_duration(3725.4), "1:02:05");
    }

    #[test]
    fn test_missing_file_is_reported() {
        let ctx = EditorContext::in_memory(Default::default());
        let result = import_file(&ctx, Path::new("/definitely/not/here.gpx"));
        assert!(matches!(result, Err(CliError::Io { .. })));
        assert!(ctx.snapshot().is_empty());
    }
}
