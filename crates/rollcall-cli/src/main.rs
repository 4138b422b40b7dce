use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use rollcall_core::{select_encoder, SimilarityPolicy};
use rollcall_engine::{DirArtifactStore, Engine, FileBackend, ReconcileMode, RosterStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face roster enrollment and identification")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the single face in an image under an identity
    Enroll {
        identity: String,
        image: PathBuf,
        /// Enroll even if the face duplicates another identity
        #[arg(long)]
        force: bool,
    },
    /// Identify every face in an image
    Verify { image: PathBuf },
    /// Report the faces found in an image without consulting the roster
    Detect { image: PathBuf },
    /// Remove an identity and its stored artifacts
    Delete {
        identity: String,
        /// Leave crops and uploads on disk
        #[arg(long)]
        keep_artifacts: bool,
    },
    /// Relabel an identity, keeping its descriptor
    Rename { from: String, to: String },
    /// Enroll every image in a directory, keyed by file stem
    Reconcile {
        /// Defaults to the uploads directory
        dir: Option<PathBuf>,
        /// Clear the roster and enroll everything again
        #[arg(long)]
        rebuild: bool,
    },
    /// Show the enrolled identities
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");
    let engine = build_engine(&config)?;

    match cli.command {
        Commands::Enroll { identity, image, force } => {
            let image = load_image(&image)?;
            print_json(&engine.enroll(&identity, &image, force)?)
        }
        Commands::Verify { image } => {
            let image = load_image(&image)?;
            print_json(&engine.verify(&image)?)
        }
        Commands::Detect { image } => {
            let image = load_image(&image)?;
            print_json(&engine.detect(&image)?)
        }
        Commands::Delete { identity, keep_artifacts } => {
            let result = engine.delete(&identity)?;
            if !keep_artifacts {
                remove_artifacts(&result.artifacts);
            }
            print_json(&result)
        }
        Commands::Rename { from, to } => print_json(&engine.rename(&from, &to)?),
        Commands::Reconcile { dir, rebuild } => {
            let dir = dir.unwrap_or_else(|| config.uploads_dir.clone());
            let mode = if rebuild {
                ReconcileMode::Rebuild
            } else {
                ReconcileMode::Incremental
            };
            print_json(&engine.reconcile(&dir, mode)?)
        }
        Commands::List => print_json(&engine.list()),
    }
}

fn build_engine(config: &Config) -> Result<Engine> {
    let encoder = select_encoder(&config.model_dir, config.backend)
        .with_context(|| format!("loading face models from {}", config.model_dir.display()))?;
    let backend = encoder.backend().clone();

    let policy =
        SimilarityPolicy::for_backend(&backend)?.with_thresholds(config.thresholds(&backend))?;
    let store = RosterStore::open(Box::new(FileBackend::new(&config.roster_path)), &backend)
        .with_context(|| format!("opening roster {}", config.roster_path.display()))?;
    let artifacts = DirArtifactStore::new(&config.crops_dir).with_uploads_dir(&config.uploads_dir);

    let engine = Engine::new(encoder, policy, store, Box::new(artifacts))?
        .with_multi_face_policy(config.multi_face);
    Ok(engine)
}

fn load_image(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("reading image {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn remove_artifacts(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed artifact"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact")
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
