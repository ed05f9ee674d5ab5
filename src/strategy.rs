//! Choosing between the async and thread-pool batch strategies.
//!
//! Availability of the async strategy is decided once per selector (the
//! selector is built once per process) and then cached:
//!
//! 1. `VERSIONTRACKER_ASYNC_BREW` set to `0`, `false`, `no` or `off` disables it
//! 2. otherwise the `async_brew.enabled` config flag decides
//! 3. finally the strategy must be present and able to start its event loop
//!
//! When the async strategy fails for any reason, its partial results are
//! dropped and the same items run once through the thread-pool strategy.

use crate::apps::InstalledApp;
use crate::config::ASYNC_BREW_ENV;
use crate::error::Result;
use crate::scheduler::{BatchStrategy, LookupContext, LookupKind, LookupResult};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Whether an environment value turns the async strategy off.
pub fn is_disabling_value(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

/// Build and discard a throwaway runtime on its own thread.
///
/// Dropping a runtime on a thread that is already driving one panics, and
/// callers may well be inside an async context.
fn can_start_event_loop() -> bool {
    std::thread::Builder::new()
        .name("versiontracker-runtime-check".into())
        .spawn(|| {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map(|runtime| runtime.shutdown_background())
                .is_ok()
        })
        .ok()
        .and_then(|handle| handle.join().ok())
        .unwrap_or(false)
}

pub struct StrategySelector {
    sync_strategy: Box<dyn BatchStrategy>,
    async_strategy: Option<Box<dyn BatchStrategy>>,
    config_enabled: bool,
    env_override: Option<String>,
    available: OnceLock<bool>,
}

impl StrategySelector {
    /// Reads the environment override once, here.
    pub fn new(
        sync_strategy: Box<dyn BatchStrategy>,
        async_strategy: Option<Box<dyn BatchStrategy>>,
        config_enabled: bool,
    ) -> Self {
        Self {
            sync_strategy,
            async_strategy,
            config_enabled,
            env_override: std::env::var(ASYNC_BREW_ENV).ok(),
            available: OnceLock::new(),
        }
    }

    /// Replace the captured environment override.
    pub fn with_env_override(mut self, value: Option<&str>) -> Self {
        self.env_override = value.map(String::from);
        self.available = OnceLock::new();
        self
    }

    /// Whether the async strategy will be attempted. Computed once.
    pub fn async_available(&self) -> bool {
        *self.available.get_or_init(|| {
            if let Some(value) = &self.env_override
                && is_disabling_value(value)
            {
                debug!(value = %value, "async strategy disabled by {}", ASYNC_BREW_ENV);
                return false;
            }
            if !self.config_enabled {
                debug!("async strategy disabled by configuration");
                return false;
            }
            if self.async_strategy.is_none() {
                return false;
            }
            let runtime_ok = can_start_event_loop();
            if !runtime_ok {
                warn!("cannot start an event loop; using thread pool");
            }
            runtime_ok
        })
    }

    /// Run `items` through the preferred strategy, falling back to the
    /// thread pool on any failure of the async path.
    pub fn execute(
        &self,
        items: &[InstalledApp],
        kind: LookupKind,
        ctx: &LookupContext,
    ) -> Result<Vec<LookupResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        if self.async_available()
            && let Some(strategy) = &self.async_strategy
        {
            match strategy.run(items, kind, ctx) {
                Ok(results) => return Ok(results),
                Err(e) => {
                    warn!(
                        error = %e,
                        discarded = e.partial_results().map_or(0, |p| p.len()),
                        "{} strategy failed, retrying with {}",
                        strategy.name(),
                        self.sync_strategy.name()
                    );
                }
            }
        }

        self.sync_strategy.run(items, kind, ctx)
    }
}
