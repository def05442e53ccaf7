//! Verse Align command line.
//!
//! Assesses a source/target text pair from line files or stored revisions
//! and writes every result table to an output directory.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use verse_align::prelude::*;

#[derive(Parser)]
#[command(name = "verse-align")]
#[command(about = "Word- and verse-level translation quality assessment")]
#[command(version)]
struct Cli {
    /// Only log warnings and errors, skip the console summary
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assess a target text against a source text
    ///
    /// Parameters start from AssessmentParams::default(), the --batch-preset
    /// values or --config (one of the two), then any flag given explicitly.
    Assess {
        /// Canonical verse list, one verse id per line
        #[arg(long)]
        verses: PathBuf,

        /// Source text file, one line per verse
        #[arg(long, conflicts_with = "source_revision")]
        source: Option<PathBuf>,

        /// Target text file, one line per verse
        #[arg(long, conflicts_with = "target_revision")]
        target: Option<PathBuf>,

        /// Source revision id stored in --db
        #[arg(long, requires = "db")]
        source_revision: Option<i64>,

        /// Target revision id stored in --db
        #[arg(long, requires = "db")]
        target_revision: Option<i64>,

        /// SQLite database for revisions and recorded results
        #[arg(long)]
        db: Option<PathBuf>,

        /// Record fused rows and verse summaries under this id in --db
        #[arg(long, requires = "db")]
        assessment_id: Option<i64>,

        /// Directory for the CSV tables and result.json
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Label for logs and output [default: <source>/<target>]
        #[arg(long)]
        label: Option<String>,

        /// JSON file with assessment parameters
        #[arg(long)]
        config: Option<PathBuf>,

        /// Start from the stricter high-volume preset
        #[arg(long, conflicts_with = "config")]
        batch_preset: bool,

        /// Encoder weights JSON ({rows, cols, data})
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Persist word indexes and match memos here (in-memory if absent)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Rebuild cached word indexes and match memos
        #[arg(long)]
        refresh_cache: bool,

        // === Overrides; all Option<T> so an unset flag keeps the configured value ===

        /// Keep matches with Jaccard similarity above this [default: 0.0]
        #[arg(long)]
        similarity_threshold: Option<f64>,

        /// Keep matches sharing more than this many verses [default: 0]
        #[arg(long)]
        count_threshold: Option<u32>,

        /// EM iterations per direction [default: 5]
        #[arg(long)]
        iterations: Option<usize>,

        /// Abort alignment training after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Verses before this id use embedding weighting
        #[arg(long, conflicts_with = "no_embedding_coverage")]
        embedding_cutoff: Option<String>,

        /// No verse uses embedding weighting
        #[arg(long)]
        no_embedding_coverage: bool,

        /// Print the N lowest-scoring verses
        #[arg(long)]
        show_verses: Option<usize>,
    },

    /// Import a revision's text into the database
    Import {
        /// SQLite database path
        #[arg(long)]
        db: PathBuf,

        /// Revision id to store the text under
        #[arg(long)]
        revision_id: i64,

        /// Canonical verse list, one verse id per line
        #[arg(long)]
        verses: PathBuf,

        /// Text file, one line per verse
        #[arg(long)]
        text: PathBuf,
    },
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "verse_align=warn" } else { "verse_align=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

/// Lines from a file, or from a stored revision when no file is given.
fn load_text(
    file: Option<&Path>,
    revision: Option<i64>,
    store: Option<&SqliteStore>,
    verse_refs: &[String],
    side: &str,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    match (file, revision, store) {
        (Some(path), _, _) => Ok(read_lines(path)?),
        (None, Some(id), Some(store)) => Ok(store.fetch_revision(id, verse_refs)?),
        _ => Err(format!("no {} text: pass --{} or --{}-revision with --db", side, side, side).into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    match cli.command {
        Commands::Assess {
            verses,
            source,
            target,
            source_revision,
            target_revision,
            db,
            assessment_id,
            output_dir,
            label,
            config,
            batch_preset,
            weights,
            cache_dir,
            refresh_cache,
            similarity_threshold,
            count_threshold,
            iterations,
            timeout_secs,
            embedding_cutoff,
            no_embedding_coverage,
            show_verses,
        } => {
            // Preset or config file, then explicit flags
            let base = match config {
                Some(path) => AssessmentParams::from_json_file(&path)?,
                None if batch_preset => AssessmentParams::batch(),
                None => AssessmentParams::default(),
            };
            let mut training = base.training.clone();
            training.iterations = iterations.unwrap_or(training.iterations);
            training.timeout_secs = timeout_secs.or(training.timeout_secs);

            let embedding_coverage = if no_embedding_coverage {
                EmbeddingCoverage::Nothing
            } else if let Some(cutoff) = embedding_cutoff {
                EmbeddingCoverage::Before { cutoff }
            } else {
                base.embedding_coverage.clone()
            };

            let params = AssessmentParams {
                similarity_threshold: similarity_threshold.unwrap_or(base.similarity_threshold),
                count_threshold: count_threshold.unwrap_or(base.count_threshold),
                training,
                embedding_coverage,
                ..base
            };

            let mut store = db.as_deref().map(SqliteStore::open).transpose()?;

            let verse_refs = read_lines(&verses)?;
            let source_lines = load_text(source.as_deref(), source_revision, store.as_ref(), &verse_refs, "source")?;
            let target_lines = load_text(target.as_deref(), target_revision, store.as_ref(), &verse_refs, "target")?;

            let label = label.unwrap_or_else(|| {
                let name = |file: &Option<PathBuf>, revision: Option<i64>| match (file, revision) {
                    (Some(path), _) => path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    (None, Some(id)) => format!("rev{}", id),
                    (None, None) => String::new(),
                };
                format!("{}/{}", name(&source, source_revision), name(&target, target_revision))
            });

            let job = PairJob {
                label,
                source: source_lines,
                target: target_lines,
                verse_refs,
            };

            let encoder = weights.as_deref().map(EncoderWeights::from_json_file).transpose()?;
            let options = AssessOptions {
                refresh_cache,
                show_progress: !cli.quiet,
                weights: encoder.as_ref(),
            };

            let result = match cache_dir {
                Some(dir) => assess_pair(&job, &params, &Cache::new(JsonFileStore::new(dir)?), &options)?,
                None => assess_pair(&job, &params, &Cache::new(MemoryStore::default()), &options)?,
            };

            if let Some(dir) = &output_dir {
                write_result_dir(&result, dir)?;
            }

            if let (Some(id), Some(store)) = (assessment_id, store.as_mut()) {
                store.record(id, &result.fused, &result.verses)?;
            }

            if !cli.quiet {
                print_summary(&result);
                if let Some(dir) = &output_dir {
                    eprintln!("\nOutput: {}", dir.display());
                }
            }

            if let Some(limit) = show_verses {
                println!("\n=== Lowest Verses ===");
                print_lowest_verses(&result.verses, Some(limit));
            }
        }

        Commands::Import {
            db,
            revision_id,
            verses,
            text,
        } => {
            let verse_refs = read_lines(&verses)?;
            let lines = read_lines(&text)?;
            let mut store = SqliteStore::open(&db)?;
            let stored = store.import_revision(revision_id, &verse_refs, &lines)?;
            info!(revision_id, stored, db = %db.display(), "import complete");
        }
    }

    Ok(())
}
