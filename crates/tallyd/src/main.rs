use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod dbus_interface;
mod engine;
mod helper;
mod locks;
mod notify;

use attendance::{AttendanceService, Settings, SystemClock};
use config::{BusKind, Config, NotifierKind};
use notify::{LogNotifier, Notifier, SpoolNotifier};

const BUS_NAME: &str = "io.tally.Attendance1";
const OBJECT_PATH: &str = "/io/tally/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("tallyd starting");

    let config = Config::load()?;
    let tz = config.reference_offset()?;

    if let Some(dir) = config.db_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = tally_store::AttendanceStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "store opened");

    let extract_timeout = Duration::from_secs(config.extractor_timeout_secs);
    let mut extractor = helper::HelperExtractor::new(config.extractor_command.clone()).with_timeout(extract_timeout);
    if let Some(model) = &config.extractor_model {
        extractor = extractor.with_model_version(model);
    }
    let engine = engine::spawn_engine(Box::new(extractor))?;

    let notifier: Arc<dyn Notifier> = match config.notifier {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Spool => {
            if let Some(dir) = config.spool_path.parent() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
            Arc::new(SpoolNotifier::new(&config.spool_path))
        }
    };

    let service = Arc::new(AttendanceService::new(
        store,
        engine,
        notifier,
        Arc::new(SystemClock),
        Settings {
            threshold: config.distance_threshold,
            tz,
            extract_timeout,
            lock_timeout: Duration::from_secs(config.lock_timeout_secs),
        },
    ));

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::TallyService::new(service))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = ?config.bus,
        threshold = config.distance_threshold,
        utc_offset = %tz,
        "tallyd ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("tallyd shutting down");

    Ok(())
}
