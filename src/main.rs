//! clipdex CLI
//!
//! # Usage
//!
//! ```bash
//! # Embed the configured videos (precomputed .f32 beside each video) and bind
//! clipdex ingest --manifest pipeline.json
//!
//! # Answer the configured query and write the results file
//! clipdex retrieve --manifest pipeline.json
//!
//! # Segmented index maintenance
//! clipdex train --manifest pipeline.json
//! clipdex compact --index-dir index/clip_vit_b32 --force
//! clipdex recover --index-dir index/clip_vit_b32
//! clipdex verify --index-dir index/clip_vit_b32 --deep
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clipdex::config::{load_manifest, IndexDesignConfig};
use clipdex::index::{recover, verify, IndexManifest, IndexPaths, IndexType, SegmentedIndex};
use clipdex::{inspect_vector, EmbeddingStore, Pipeline, PrecomputedEncoder, RetrievalError};

#[derive(Parser)]
#[command(name = "clipdex")]
#[command(about = "Video-text retrieval over stored CLIP embeddings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct IndexTarget {
    /// Pipeline manifest; the index root is its `index.dir`
    #[arg(short, long, conflicts_with = "index_dir")]
    manifest: Option<PathBuf>,

    /// Index root (MANIFEST.json, segments/)
    #[arg(long)]
    index_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed and store every configured video, then bind the index dir
    Ingest {
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Search the bound embeddings with the configured query
    Retrieve {
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Train the segmented index on a sample of its sealed vectors
    Train {
        #[command(flatten)]
        target: IndexTarget,

        /// Override the configured index type (FLAT, IVF_PQ, HNSW)
        #[arg(long = "type")]
        index_type: Option<String>,
    },

    /// Seal an N x dim batch file as one segment
    BuildSegment {
        #[command(flatten)]
        target: IndexTarget,

        /// Row-major little-endian f32 batch file
        #[arg(long)]
        batch: PathBuf,

        #[arg(long)]
        dim: usize,

        #[arg(long)]
        count: usize,

        /// Row ids become "{video_id}#{row}"
        #[arg(long)]
        video_id: String,
    },

    /// Merge sealed segments into one
    Compact {
        #[command(flatten)]
        target: IndexTarget,

        /// Compact even below the configured threshold
        #[arg(long)]
        force: bool,
    },

    /// Remove staging leftovers and orphaned segment files
    Recover {
        #[command(flatten)]
        target: IndexTarget,
    },

    /// Check every segment referenced by the manifest
    Verify {
        #[command(flatten)]
        target: IndexTarget,

        /// Recompute sha256 digests
        #[arg(long)]
        deep: bool,
    },

    /// Rebuild the segmented index from the embedding output dir
    Reindex {
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Print summary statistics of a vector file
    Inspect {
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        dim: Option<usize>,
    },

    /// Print the state of a segmented index
    Stats {
        #[command(flatten)]
        target: IndexTarget,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<RetrievalError>())
                .map(|e| e.kind().exit_code())
                .unwrap_or(1);
            eprintln!("error: {:#}", err);
            ExitCode::from(code as u8)
        }
    }
}

/// Index root and design for commands that accept `--manifest` or `--index-dir`.
fn resolve_target(target: &IndexTarget) -> anyhow::Result<(PathBuf, IndexDesignConfig)> {
    if let Some(path) = &target.manifest {
        let manifest = load_manifest(path)?;
        let design = manifest.design()?;
        return Ok((manifest.index.dir, design));
    }
    let Some(root) = &target.index_dir else {
        return Err(RetrievalError::Config("pass --manifest or --index-dir".into()).into());
    };

    // Without a pipeline manifest the published index manifest supplies
    // the type, metric and variant.
    let mut design = IndexDesignConfig::default();
    if let Some(existing) = IndexManifest::load(&IndexPaths::new(root).manifest())? {
        design.index_type = existing.index_type;
        design.metric = existing.metric;
        design.variant = existing.variant;
    }
    Ok((root.clone(), design))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Ingest { manifest } => {
            let pipeline = Pipeline::from_manifest_path(&manifest, Some(Arc::new(PrecomputedEncoder)))?;
            let report = tokio::task::spawn_blocking(move || pipeline.ingest())
                .await
                .context("ingest task join")??;
            println!("processed={} failed={}", report.processed, report.failures.len());
            for failure in &report.failures {
                println!("  {:?}: {} ({})", failure.input, failure.message, failure.kind);
            }
            if let Some(reindex) = &report.reindex {
                println!(
                    "reindexed vectors={} segments={} trained={}",
                    reindex.vectors, reindex.segments, reindex.trained
                );
            }
            if !report.failures.is_empty() {
                bail!("{} of {} items failed", report.failures.len(), report.failures.len() + report.processed);
            }
        }

        Commands::Retrieve { manifest } => {
            let pipeline = Pipeline::from_manifest_path(&manifest, None)?;
            let report = tokio::task::spawn_blocking(move || pipeline.retrieve())
                .await
                .context("retrieve task join")??;
            println!(
                "backend={} hits={} output={:?}",
                report.backend,
                report.hits.len(),
                report.output_path
            );
            for (rank, hit) in report.hits.iter().enumerate() {
                println!("{:>3}. {} {:.6}", rank + 1, hit.id, hit.score);
            }
        }

        Commands::Train { target, index_type } => {
            let (root, mut design) = resolve_target(&target)?;
            if let Some(name) = index_type {
                design = design.with_index_type(IndexType::parse_lenient(&name));
            }
            let index = SegmentedIndex::open(&root, design)?;
            let report = index.train().with_context(|| format!("training {:?}", root))?;
            println!(
                "trained type={} sample={} info={}",
                report.index_type.as_str(),
                report.sample,
                report.info
            );
        }

        Commands::BuildSegment {
            target,
            batch,
            dim,
            count,
            video_id,
        } => {
            let (root, design) = resolve_target(&target)?;
            let index = SegmentedIndex::open(&root, design)?;
            let meta = index
                .build_segment_from_batch(&batch, dim, count, &video_id)
                .with_context(|| format!("building segment from {:?}", batch))?;
            println!("sealed file={} count={}", meta.file, meta.count);
        }

        Commands::Compact { target, force } => {
            let (root, design) = resolve_target(&target)?;
            let report = SegmentedIndex::open(&root, design)?.compact(force)?;
            match &report.new_segment {
                Some(seg) => println!(
                    "compacted segments={} vectors={} into={}",
                    report.merged_segments, report.vectors, seg.file
                ),
                None => println!("nothing to compact"),
            }
        }

        Commands::Recover { target } => {
            let (root, _) = resolve_target(&target)?;
            let report = recover(&root).with_context(|| format!("recovering {:?}", root))?;
            println!(
                "active_segments={} orphans_removed={} staging_removed={} temp_removed={}",
                report.active_segments,
                report.orphans_removed,
                report.staging_removed,
                report.temp_removed
            );
            if let Some(path) = &target.manifest {
                let cfg = load_manifest(path)?;
                let swept = EmbeddingStore::single_variant(&cfg.ingest.output_dir).collect_garbage()?;
                println!("embedding_temp_removed={}", swept);
            }
        }

        Commands::Verify { target, deep } => {
            let (root, _) = resolve_target(&target)?;
            let report = verify(&root, deep).with_context(|| format!("verifying {:?}", root))?;
            println!(
                "segments={} vectors={} checksums_verified={} orphans={}",
                report.segments_checked,
                report.vectors,
                report.checksums_verified,
                report.orphans.len()
            );
            for orphan in &report.orphans {
                println!("  orphan {:?}", orphan);
            }
        }

        Commands::Reindex { manifest } => {
            let cfg = load_manifest(&manifest)?;
            let index = SegmentedIndex::open(&cfg.index.dir, cfg.design()?)?;
            let report = index.reindex(&cfg.ingest.output_dir, None)?;
            println!(
                "vectors={} segments={} trained={}",
                report.vectors, report.segments, report.trained
            );
        }

        Commands::Inspect { file, dim } => {
            let summary = inspect_vector(&file, dim)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Stats { target } => {
            let (root, design) = resolve_target(&target)?;
            let stats = SegmentedIndex::open(&root, design)?.stats()?;
            println!("Index root: {:?}", root);
            println!(
                "  Type: {}",
                stats.index_type.map(|t| t.as_str()).unwrap_or("none")
            );
            println!("  Dimensions: {}", stats.dim);
            println!("  Segments: {}", stats.segments);
            println!("  Vectors: {}", stats.vectors);
            println!("  Trained: {}", stats.trained);
        }
    }
    Ok(())
}
