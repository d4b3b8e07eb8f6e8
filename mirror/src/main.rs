use clap::Parser;
use log::{error, info, warn};
use mirror::config::{self, AccessPolicy};
use mirror::error_log::ErrorLog;
use mirror::geo::{GeoLookup, MaxMindLookup, UnavailableLookup};
use mirror::geo_update::{self, DEFAULT_DATABASE_URL};
use mirror::heartbeat::{DEFAULT_DIRECTORY_HOST, DEFAULT_DIRECTORY_PORT};
use mirror::mirror_set::{DirectoryTarget, MirrorContext, MirrorSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Mirror list
    #[arg(long, default_value = "Servers.json")]
    servers: PathBuf,

    /// Access policy
    #[arg(long, default_value = "Settings.json")]
    settings: PathBuf,

    /// MaxMind City database used by the access policy
    #[arg(long, default_value = "GeoLite2-City.mmdb")]
    geoip_db: PathBuf,

    /// Gzip-compressed database downloaded over `geoip_db` on startup
    #[arg(long, default_value = DEFAULT_DATABASE_URL)]
    geoip_url: String,

    /// Use the database on disk as-is
    #[arg(long)]
    skip_geoip_update: bool,

    /// File that collects geolocation failures
    #[arg(long, default_value = "Errors.txt")]
    error_log: PathBuf,

    /// Master server directory host
    #[arg(long, default_value = DEFAULT_DIRECTORY_HOST)]
    master_host: String,

    /// Master server directory port
    #[arg(long, default_value_t = DEFAULT_DIRECTORY_PORT)]
    master_port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    config::ensure_default_files(&args.servers, &args.settings)?;
    let policy = AccessPolicy::from(config::load_settings(&args.settings)?);

    // RUST_LOG still wins over the settings file
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(policy.log_filter()))
        .init();

    if !args.skip_geoip_update {
        geo_update::refresh_database(&args.geoip_db, &args.geoip_url).await;
    }

    let error_log = ErrorLog::new(&args.error_log);
    error_log.ensure_exists()?;

    let entries = config::load_servers(&args.servers)?;

    let geo: Arc<dyn GeoLookup> = match MaxMindLookup::open(&args.geoip_db) {
        Ok(lookup) => Arc::new(lookup),
        Err(e) => {
            if policy.any_enabled() {
                warn!("{}; access rules will deny every requester", e);
            }
            Arc::new(UnavailableLookup::new(e.to_string()))
        }
    };

    let context = MirrorContext::new(policy, geo, error_log).with_directory(DirectoryTarget {
        host: args.master_host,
        port: args.master_port,
    });

    info!("Starting {} mirror(s)", entries.len());
    let set = MirrorSet::start(&entries, &context).await;

    if set.running().is_empty() {
        warn!("No mirror is running; check {}", args.servers.display());
    }
    if !set.failures().is_empty() {
        error!(
            "{} of {} mirror(s) failed to start",
            set.failures().len(),
            entries.len()
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    set.shutdown();

    Ok(())
}
