//! High-level questions about installed applications.
//!
//! [`Orchestrator`] owns the shared resources of a run (cache, matcher,
//! strategy selector, Homebrew environment) and answers:
//!
//! - which installed apps could be installed through a cask?
//!   ([`Orchestrator::check_brew_install_candidates`])
//! - which installed apps have a newer cask version?
//!   ([`Orchestrator::check_brew_update_candidates`])
//!
//! # Examples
//!
//! ```no_run
//! use versiontracker::{Config, InstalledApp, Orchestrator};
//!
//! fn main() -> anyhow::Result<()> {
//!     let orchestrator = Orchestrator::from_config(Config::default())?;
//!     let apps = vec![InstalledApp::new("Firefox", "100.0")];
//!     for (name, version, installable) in orchestrator.check_brew_install_candidates(&apps, None, true)? {
//!         println!("{name} {version}: {installable}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::apps::InstalledApp;
use crate::cache::{CacheLevel, Priority, TieredCache};
use crate::config::Config;
use crate::error::Result;
use crate::matcher::NameMatcher;
use crate::query::{BrewCli, BrewEnvironment, HttpCaskClient};
use crate::rate_limit;
use crate::scheduler::{
    AsyncStrategy, BatchSettings, BatchStrategy, LookupContext, LookupKind, ThreadPoolStrategy,
};
use crate::strategy::StrategySelector;
use crate::version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INSTALLED_CASKS_KEY: &str = "installed_casks";
const INSTALLED_CASKS_SOURCE: &str = "brew-list";
const INSTALLED_CASKS_TTL: Duration = Duration::from_secs(60 * 60);

/// An installed app with a newer cask version available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    /// Installed version
    pub version: String,
    pub latest_version: String,
    pub cask: String,
    /// Match score (0-100) between the app name and the cask
    pub similarity: u8,
}

pub struct Orchestrator {
    config: Config,
    cache: Arc<TieredCache>,
    matcher: Arc<NameMatcher>,
    environment: Arc<dyn BrewEnvironment>,
    selector: StrategySelector,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        cache: Arc<TieredCache>,
        matcher: Arc<NameMatcher>,
        environment: Arc<dyn BrewEnvironment>,
        selector: StrategySelector,
    ) -> Self {
        Self {
            config,
            cache,
            matcher,
            environment,
            selector,
        }
    }

    /// Wire up the production stack: `brew` CLI for the thread-pool
    /// strategy, the JSON API for the async one, and an on-disk cache.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(TieredCache::from_config(&config.cache)?);
        let settings = BatchSettings::from(&config);

        let brew = Arc::new(BrewCli::new(
            config.matching.brew_path.clone(),
            config.batch.timeout(),
        ));
        let sync_strategy = ThreadPoolStrategy::new(Arc::clone(&brew), settings)?;

        let async_strategy: Option<Box<dyn BatchStrategy>> =
            match HttpCaskClient::new(&config.async_brew.api_base_url, config.batch.timeout()) {
                Ok(client) => Some(Box::new(AsyncStrategy::new(
                    Arc::new(client),
                    settings,
                    config.async_brew.max_concurrency,
                ))),
                Err(e) => {
                    warn!(error = %e, "HTTP client unavailable; async strategy disabled");
                    None
                }
            };

        let selector = StrategySelector::new(
            Box::new(sync_strategy),
            async_strategy,
            config.async_brew.enabled,
        );

        Ok(Self::new(
            config,
            cache,
            Arc::new(NameMatcher::default()),
            brew,
            selector,
        ))
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drop every cached entry, including the installed-cask list.
    pub fn invalidate(&self) -> Result<()> {
        self.cache.invalidate()
    }

    fn context(&self, rate_limit: Option<f64>, use_cache: bool) -> LookupContext {
        LookupContext::new(
            Arc::clone(&self.matcher),
            rate_limit::from_config(&self.config.rate_limit, rate_limit),
            use_cache.then(|| Arc::clone(&self.cache)),
            self.config.matching.similarity_threshold,
        )
    }

    /// Casks already installed through Homebrew, cached for an hour.
    fn installed_casks(&self, use_cache: bool) -> Result<Vec<String>> {
        let fetch = || self.environment.installed_casks().map_err(Into::into);
        if !use_cache {
            return fetch();
        }
        self.cache.get_or_set(
            INSTALLED_CASKS_KEY,
            fetch,
            CacheLevel::All,
            Some(INSTALLED_CASKS_TTL),
            Priority::High,
            INSTALLED_CASKS_SOURCE,
        )
    }

    /// Apps not already managed by Homebrew, in input order. Repeated names
    /// are kept: each input gets its own result.
    fn unmanaged(&self, apps: &[InstalledApp], installed: &[String]) -> Vec<InstalledApp> {
        let threshold = self.config.matching.similarity_threshold;
        apps.iter()
            .filter(|app| match self.matcher.best_match(&app.name, installed, threshold) {
                Some((cask, score)) => {
                    debug!(app = %app.name, cask, score, "already managed");
                    false
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    /// For each installed app not already managed by Homebrew, whether a
    /// cask exists that could install it. Results keep input order.
    ///
    /// When Homebrew itself is unavailable every app is reported as not
    /// installable and nothing is queried.
    pub fn check_brew_install_candidates(
        &self,
        apps: &[InstalledApp],
        rate_limit: Option<f64>,
        use_cache: bool,
    ) -> Result<Vec<(String, String, bool)>> {
        if apps.is_empty() {
            return Ok(Vec::new());
        }

        if !self.environment.is_available() {
            warn!("Homebrew is not available; no app can be installed through it");
            return Ok(apps
                .iter()
                .map(|app| (app.name.clone(), app.version.clone(), false))
                .collect());
        }

        let installed = self.installed_casks(use_cache)?;
        let candidates = self.unmanaged(apps, &installed);
        info!(
            apps = apps.len(),
            managed = installed.len(),
            candidates = candidates.len(),
            "checking installability"
        );

        let ctx = self.context(rate_limit, use_cache);
        let results = self.selector.execute(&candidates, LookupKind::Installable, &ctx)?;

        Ok(results
            .into_iter()
            .map(|r| {
                let installable = r.is_installable();
                (r.name, r.installed_version, installable)
            })
            .collect())
    }

    /// Installed apps (not already managed by Homebrew) whose best-matching
    /// cask reports a newer version. Apps without one are left out.
    pub fn check_brew_update_candidates(
        &self,
        apps: &[InstalledApp],
        rate_limit: Option<f64>,
    ) -> Result<BTreeMap<String, UpdateCandidate>> {
        if apps.is_empty() {
            return Ok(BTreeMap::new());
        }

        let installed = if self.environment.is_available() {
            self.installed_casks(true)?
        } else {
            Vec::new()
        };
        let candidates = self.unmanaged(apps, &installed);
        info!(apps = apps.len(), candidates = candidates.len(), "checking for updates");

        let ctx = self.context(rate_limit, true);
        let results = self.selector.execute(&candidates, LookupKind::LatestVersion, &ctx)?;

        let mut updates = BTreeMap::new();
        for result in results {
            let (Some(latest), Some(cask)) = (result.latest_version(), result.matched_package_id.as_deref())
            else {
                continue;
            };
            if !version::is_newer(&result.installed_version, latest) {
                continue;
            }
            updates.insert(
                result.name.clone(),
                UpdateCandidate {
                    version: result.installed_version.clone(),
                    latest_version: version::strip_build_suffix(latest).to_string(),
                    cask: cask.to_string(),
                    similarity: result.similarity,
                },
            );
        }
        Ok(updates)
    }
}
