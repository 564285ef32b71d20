//! Application state.

use anyhow::Context;
use orca_core::consent::StoredConsentSource;
use orca_core::store::{SqliteBackend, StoreBackend};
use orca_core::{AnalysisProvider, Coordinator, DrainController, SessionStore, ShutdownTrigger};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::provider;

/// Shared application state
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Session store shared by the coordinator and the drain controller
    pub store: Arc<SessionStore>,
    /// Session coordinator
    pub coordinator: Arc<Coordinator>,
    /// Shutdown drain controller
    pub drain: Arc<DrainController>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Open the SQLite store and build providers from the configuration
    pub fn open(config: Config) -> anyhow::Result<Arc<Self>> {
        let backend = SqliteBackend::open(&config.database_path).with_context(|| {
            format!("Failed to open session store {}", config.database_path.display())
        })?;
        let providers = provider::build_providers(&config.file.providers)?;
        Self::new(config, Arc::new(backend), providers)
    }

    /// Create new application state
    pub fn new(
        config: Config,
        backend: Arc<dyn StoreBackend>,
        providers: Vec<Arc<dyn AnalysisProvider>>,
    ) -> anyhow::Result<Arc<Self>> {
        let core = &config.file.core;
        core.validate()?;

        let store = Arc::new(SessionStore::new(backend, core.store.clone()));
        let consent = Arc::new(StoredConsentSource::new(store.clone()));
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            consent,
            providers,
            core.coordinator.clone(),
        )?);
        let drain = Arc::new(DrainController::new(coordinator.clone(), core.drain.clone()));

        Ok(Arc::new(Self {
            config: Arc::new(config),
            store,
            coordinator,
            drain,
            start_time: Instant::now(),
        }))
    }

    /// Handle for requesting shutdown
    pub fn trigger(&self) -> ShutdownTrigger {
        self.drain.trigger_handle()
    }
}
