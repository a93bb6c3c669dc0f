use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use webp_relay::bulk::{BulkJob, JobRequest};
use webp_relay::cache::CacheStore;
use webp_relay::config::{self, RelayConfig};
use webp_relay::library::Library;
use webp_relay::serve;

#[derive(Parser)]
#[command(name = "webp-relay")]
#[command(about = "Transparent WebP conversion, caching, and delivery")]
#[command(long_about = "\
Transparent WebP conversion, caching, and delivery

webp-relay sits in front of an existing image library. Capable clients
transparently receive cached WebP artifacts instead of JPEG/PNG/GIF
originals; everyone else keeps getting the originals, byte for byte.

  serve     intercept image requests, serve artifacts with long-lived
            caching headers, rewrite outgoing HTML to <picture> markup
  convert   request the cached artifact for one image (converting on demand)
  bulk      pre-populate the cache across the whole library, one resumable
            batch per invocation
  reset     clear the persisted bulk progress record
  gen-config  print a documented webp-relay.toml with all defaults

Conversion policy: JPEG/GIF sources encode at the configured quality
(default 80), PNG at the high-compression quality (default 60), and any
source over the size threshold (default 100 KiB) is forced to high
compression. A WebP that is not smaller than its source is discarded and
the original is served instead.")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "webp-relay.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the intercepting HTTP server
    Serve,
    /// Convert one image (logical path under the image root) into the cache
    Convert {
        /// Path relative to the image root, e.g. 2024/01/photo.jpg
        path: String,
    },
    /// Advance the bulk conversion job by one batch
    Bulk {
        /// Images per batch
        #[arg(long, default_value_t = 20)]
        batch_size: usize,
        /// Delete originals after successful conversion and repoint the
        /// library records at the artifacts
        #[arg(long)]
        delete_originals: bool,
        /// Keep advancing until the job completes
        #[arg(long)]
        all: bool,
    },
    /// Clear the persisted bulk progress record
    Reset,
    /// Print a stock webp-relay.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = RelayConfig::load(&cli.config)?;

    match cli.command {
        Command::Serve => {
            let server = serve::bind(config)?;
            println!("==> Serving on http://{}", server.addr());
            server.run()?;
        }
        Command::Convert { path } => {
            let store = open_store(&config)?;
            match store.get_or_create(&path) {
                Ok(artifact) => println!("{}", artifact.display()),
                Err(e) => {
                    eprintln!("not converted ({e}); serve the original");
                    std::process::exit(1);
                }
            }
        }
        Command::Bulk {
            batch_size,
            delete_originals,
            all,
        } => {
            let job = open_job(&config)?;
            let request = JobRequest {
                batch_size,
                delete_originals,
            };
            loop {
                let outcome = job.advance(&request)?;
                println!(
                    "Batch {}: {}/{} images ({:.1}%), {} remaining",
                    outcome.progress.current_batch,
                    outcome.progress.processed,
                    outcome.progress.total,
                    outcome.percentage,
                    outcome.remaining,
                );
                for error in &outcome.progress.errors {
                    println!("    {error}");
                }
                if outcome.progress.is_complete() {
                    println!("==> Conversion complete");
                    break;
                }
                if !all {
                    println!("==> Run again to continue (progress is persisted)");
                    break;
                }
            }
        }
        Command::Reset => {
            open_job(&config)?.reset()?;
            println!("==> Bulk progress cleared");
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn open_store(config: &RelayConfig) -> std::io::Result<Arc<CacheStore>> {
    Ok(Arc::new(CacheStore::open(
        config.paths.image_root.clone(),
        config.paths.cache_root.clone(),
        config.quality_policy(),
    )?))
}

fn open_job(config: &RelayConfig) -> std::io::Result<BulkJob> {
    let store = open_store(config)?;
    Ok(BulkJob::new(
        store,
        Library::open(config.paths.image_root.clone()),
        config.paths.cache_root.clone(),
    ))
}
