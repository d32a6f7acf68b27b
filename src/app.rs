//! Process lifecycle: everything the session service needs is built here at
//! startup and torn down in [`App::shutdown`]. No globals.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use keel_cache::{CacheStore, RedisCache};
use keel_session::SessionService;
use keel_settings::{load_settings, load_settings_from_path, KeelSettings};
use keel_telemetry::TelemetryGuard;

pub struct App {
    pub settings: KeelSettings,
    pub service: SessionService,
    telemetry: Option<TelemetryGuard>,
}

impl App {
    /// Load settings, install logging, open the store, connect the cache.
    pub async fn init(config: Option<&Path>) -> Result<Self> {
        let settings = match config {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => load_settings().context("failed to load settings")?,
        };

        let telemetry = match keel_telemetry::init_telemetry(&settings.logging) {
            Ok(guard) => Some(guard),
            Err(keel_telemetry::TelemetryError::AlreadyInitialized) => None,
            Err(e) => return Err(e).context("failed to initialise logging"),
        };

        let repo = keel_store::open_repository(&settings.database)
            .await
            .context("failed to open session store")?;

        let cache = connect_cache(&settings).await?;
        let service = SessionService::start(repo, cache, &settings)
            .await
            .context("failed to start session service")?;

        info!(
            store = service.repository().backend(),
            lock_mode = service.lock_mode().as_str(),
            log_filter = telemetry.as_ref().map(TelemetryGuard::filter),
            "keel ready"
        );
        Ok(Self {
            settings,
            service,
            telemetry,
        })
    }

    pub async fn shutdown(self) {
        let health = self.service.health().await;
        info!(
            store_ok = health.store_ok,
            telemetry = self.telemetry.is_some(),
            "keel shutting down"
        );
        drop(self.service);
    }
}

async fn connect_cache(settings: &KeelSettings) -> Result<Option<Arc<dyn CacheStore>>> {
    let Some(url) = settings.cache.url.as_deref() else {
        info!("no cache configured, running single-process");
        return Ok(None);
    };
    match RedisCache::connect(url, settings.cache.op_timeout()).await {
        Ok(cache) => Ok(Some(Arc::new(cache))),
        Err(e) if settings.cache.required => bail!("cache is required but unreachable: {e}"),
        Err(e) => {
            warn!(error = %e, "cache unreachable, running single-process");
            Ok(None)
        }
    }
}
