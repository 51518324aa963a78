//! store-admin: maintenance tool for a sync directory.
//!
//! Runs the offline jobs an instance would otherwise trigger on its own
//! schedule: legacy-layout migration, garbage collection, and a read-only
//! inspection of a directory's log state.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use store_core::{gc, layout, migration, GcConfig, OpenDocument, WriterId};
use store_native::NativeFs;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "store-admin")]
#[command(about = "Maintenance tool for note storage sync directories")]
struct Args {
    /// Path to the sync directory
    #[arg(short, long)]
    sd: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert legacy per-update files to the append-only log layout
    Migrate {
        /// Also delete legacy files whose conversion is verified.
        /// Only safe once every instance sharing the directory is upgraded.
        #[arg(long)]
        cleanup: bool,
    },
    /// Delete log files subsumed by retained snapshots
    Gc {
        /// Snapshots to retain per document
        #[arg(long, default_value_t = 2)]
        keep_snapshots: usize,
        /// Never delete files younger than this many milliseconds
        #[arg(long, default_value_t = 0)]
        min_age_ms: u64,
    },
    /// Print each document's log inventory and merged clock
    Inspect {
        /// Limit to one note id
        #[arg(long)]
        note: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let fs = NativeFs::new(args.sd.clone());

    match args.command {
        Command::Migrate { cleanup } => {
            let report = migration::migrate_storage_directory(&fs).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!(
                migrated = report.files_migrated(),
                errors = report.error_count(),
                "migration finished"
            );

            if cleanup {
                for id in gc::list_documents(&fs).await? {
                    let cleaned = migration::cleanup_legacy_files(&fs, &id).await?;
                    if cleaned.files_deleted > 0 || cleaned.files_kept > 0 {
                        info!(doc = %id, deleted = cleaned.files_deleted,
                              kept = cleaned.files_kept, "legacy cleanup");
                    }
                }
            }
        }

        Command::Gc {
            keep_snapshots,
            min_age_ms,
        } => {
            let config = GcConfig {
                keep_snapshots,
                min_age_ms,
            };
            let stats = gc::run_gc(&fs, &config).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Inspect { note } => {
            let ids = match note {
                Some(note_id) => vec![layout::DocumentId::note(note_id.as_str())
                    .ok_or_else(|| anyhow::anyhow!("invalid note id: {}", note_id))?],
                None => gc::list_documents(&fs).await?,
            };

            // A throwaway writer id: inspection never appends
            let writer = WriterId::generate();
            for id in ids {
                inspect_document(&fs, writer, id).await?;
            }
        }
    }

    Ok(())
}

async fn inspect_document(fs: &NativeFs, writer: WriterId, id: layout::DocumentId) -> Result<()> {
    use store_core::FileSystem;

    println!("== {}", id);

    let dir = id.log_dir();
    if fs.exists(&dir).await? {
        let mut names: Vec<String> = fs
            .list(&dir)
            .await?
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name)
            .collect();
        names.sort();
        for name in &names {
            match layout::parse_log_filename(name) {
                Some(parsed) => println!("  {:<60} {:?}", name, parsed),
                None => println!("  {:<60} (not a log file)", name),
            }
        }
    }

    let doc = OpenDocument::open(fs, writer, id).await?;
    println!("  clock: {:?}", doc.clock());
    if doc.is_degraded() {
        println!("  DEGRADED: {} unusable files", doc.skipped_files().len());
    } else if !doc.skipped_files().is_empty() {
        println!("  skipped: {:?}", doc.skipped_files());
    }
    let title = doc.document()?.extract_title();
    if !title.is_empty() {
        println!("  title: {}", title);
    }
    Ok(())
}
