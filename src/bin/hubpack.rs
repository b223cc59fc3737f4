//! hubpack - reproducible image builder and service launcher.
//!
//! ## Usage
//!
//! ```sh
//! hubpack import python:3.11-slim rootfs.tar.gz
//! hubpack build . -t data-import-hub:0.1.0
//! hubpack run data-import-hub:0.1.0 --port 8501
//! hubpack launch            # inside the container: run the service in place
//! hubpack images | inspect <tag> | rmi <tag> | gc
//! ```
//!
//! Logs go to stderr; `build` prints the image id on stdout. `run` and
//! `launch` exit with the service's exit code.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubpack::{
    BuildFile, BuildRequest, BundleBuilder, ChrootRunner, DEFAULT_ROOT_DIR_NAME, ImageBuilder,
    ImageReference, ImageStore, LaunchOverrides, LaunchSpec, Launcher, LayerCache, ROOT_ENV_VAR,
    spawn_failure_code,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "hubpack", version, about = "Reproducible image builder and service launcher")]
struct Cli {
    /// State directory (blobs, tags, cache, bundles).
    #[arg(long, global = true, env = ROOT_ENV_VAR)]
    root: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build an image from a context directory.
    Build {
        /// Build context.
        #[arg(default_value = ".")]
        context: PathBuf,
        /// Build file (default: <context>/hubpack.toml).
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
        /// Output tag (default: [image].tag).
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Import a root filesystem archive as a base image.
    Import {
        /// Pinned reference to tag the image with.
        reference: String,
        /// tar or tar.gz archive.
        archive: PathBuf,
    },
    /// List tagged images.
    Images,
    /// Print an image's manifest and config.
    Inspect {
        /// Tag or image id.
        tag: String,
    },
    /// Remove a tag.
    Rmi {
        /// Tag to remove.
        tag: String,
    },
    /// Remove blobs, cache records and bundles no tag refers to.
    Gc,
    /// Run an image's service from its root filesystem.
    Run {
        /// Tag or image id.
        tag: String,
        #[command(flatten)]
        bind: BindArgs,
    },
    /// Run the service in place (inside a built container).
    Launch {
        /// Application directory.
        #[arg(default_value = ".")]
        context: PathBuf,
        /// Build file (default: <context>/hubpack.toml).
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
        #[command(flatten)]
        bind: BindArgs,
    },
}

#[derive(Debug, clap::Args)]
struct BindArgs {
    /// Bind port.
    #[arg(long)]
    port: Option<u16>,
    /// Bind address.
    #[arg(long)]
    address: Option<IpAddr>,
}

impl From<BindArgs> for LaunchOverrides {
    fn from(args: BindArgs) -> Self {
        Self {
            port: args.port,
            address: args.address,
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn root_dir(cli_root: Option<PathBuf>) -> PathBuf {
    cli_root.unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(DEFAULT_ROOT_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_DIR_NAME))
    })
}

async fn cmd_build(root: &Path, context: PathBuf, file: Option<PathBuf>, tag: Option<String>) -> Result<()> {
    let build_file = BuildFile::discover(&context, file.as_deref())?;
    let store = Arc::new(ImageStore::open(root)?);
    let builder = ImageBuilder::new(store, Arc::new(ChrootRunner::new()))?;

    let report = builder
        .build(&BuildRequest {
            context,
            build_file,
            tag,
        })
        .await
        .context("build failed")?;

    for stage in &report.stages {
        eprintln!(
            "{:<14} {:<8} {}",
            stage.name,
            if stage.cached { "cached" } else { "built" },
            stage.layer.digest
        );
    }
    println!("{}", report.image_id);
    Ok(())
}

fn cmd_import(root: &Path, reference: &str, archive: &Path) -> Result<()> {
    let reference = ImageReference::parse(reference)?;
    let store = ImageStore::open(root)?;
    let digest = store.import_base(&reference, archive)?;
    println!("{}", digest);
    Ok(())
}

fn cmd_images(root: &Path) -> Result<()> {
    let store = ImageStore::open(root)?;
    println!("{:<40} {:<20} {:>7} {:>12}", "TAG", "IMAGE ID", "LAYERS", "SIZE");
    for image in store.list()? {
        let short = image.digest.strip_prefix("sha256:").unwrap_or(&image.digest);
        println!(
            "{:<40} {:<20} {:>7} {:>12}",
            image.tag,
            &short[..short.len().min(12)],
            image.layers,
            image.size
        );
    }
    Ok(())
}

fn cmd_inspect(root: &Path, tag: &str) -> Result<()> {
    let store = ImageStore::open(root)?;
    let image = store.resolve(tag)?;
    let doc = serde_json::json!({
        "id": image.digest,
        "manifest": image.manifest,
        "config": image.config,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn cmd_rmi(root: &Path, tag: &str) -> Result<()> {
    let store = ImageStore::open(root)?;
    let digest = store.untag(tag)?;
    println!("Untagged: {} ({})", tag, digest);
    Ok(())
}

fn cmd_gc(root: &Path) -> Result<()> {
    let store = ImageStore::open(root)?;
    let stats = store.gc()?;
    let cache = LayerCache::under_root(root)?;
    let records = cache.prune(store.blobs())?;
    let (_, live) = store.referenced_blobs()?;
    let bundles = BundleBuilder::under_root(root, store.blobs().clone())?.prune(&live)?;
    println!(
        "Removed {} blobs ({} bytes), {} cache records, {} bundles",
        stats.removed_count, stats.freed_bytes, records, bundles
    );
    Ok(())
}

async fn cmd_run(root: &Path, tag: &str, bind: BindArgs) -> Result<u8> {
    let store = ImageStore::open(root)?;
    let image = store.resolve(tag)?;
    let bundle = BundleBuilder::under_root(root, store.blobs().clone())?.materialize(&image)?;

    let spec = LaunchSpec::from_image(&image.config, bind.into())?.with_root(bundle.rootfs);
    launch(spec).await
}

async fn cmd_launch(context: PathBuf, file: Option<PathBuf>, bind: BindArgs) -> Result<u8> {
    let build_file = BuildFile::discover(&context, file.as_deref())?;
    build_file.validate()?;
    let context = context.canonicalize().unwrap_or(context);
    let spec = LaunchSpec::from_build_file(&build_file, &context, bind.into())?;
    launch(spec).await
}

async fn launch(spec: LaunchSpec) -> Result<u8> {
    let mut launcher = Launcher::new(spec);
    let outcome = launcher.run().await?;
    Ok((outcome.exit_code & 0xff) as u8)
}

// =============================================================================
// Main
// =============================================================================

async fn run(cli: Cli) -> Result<u8> {
    let root = root_dir(cli.root);

    match cli.command {
        Commands::Build { context, file, tag } => cmd_build(&root, context, file, tag).await?,
        Commands::Import { reference, archive } => cmd_import(&root, &reference, &archive)?,
        Commands::Images => cmd_images(&root)?,
        Commands::Inspect { tag } => cmd_inspect(&root, &tag)?,
        Commands::Rmi { tag } => cmd_rmi(&root, &tag)?,
        Commands::Gc => cmd_gc(&root)?,
        Commands::Run { tag, bind } => return cmd_run(&root, &tag, bind).await,
        Commands::Launch {
            context,
            file,
            bind,
        } => return cmd_launch(context, file, bind).await,
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug { "hubpack=debug" } else { "hubpack=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            match e.downcast_ref::<hubpack::Error>() {
                Some(err @ hubpack::Error::SpawnFailed { .. }) => {
                    ExitCode::from(spawn_failure_code(err) as u8)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}
