//! Batched, rate-limited lookups over many applications.
//!
//! The input list is split into fixed-size batches that run one after
//! another; items within a batch run concurrently. Two [`BatchStrategy`]
//! implementations share the batch loop and differ only in transport:
//!
//! - [`ThreadPoolStrategy`]: a bounded rayon pool over a blocking [`CaskQuery`]
//! - [`AsyncStrategy`]: a single-threaded tokio runtime on a dedicated
//!   thread, running a bounded set of tasks over an [`AsyncCaskQuery`]
//!
//! Results always come back in input order, one per input item. A batch in
//! which every item failed for the same retryable reason bumps a shared
//! error counter; any other batch resets it. Reaching `max_errors` aborts
//! the run with [`TrackerError::BatchAborted`], carrying the results
//! gathered so far.

use crate::apps::InstalledApp;
use crate::cache::{CacheLevel, Priority, TieredCache};
use crate::config::Config;
use crate::error::{ErrorKind, Result, TrackerError};
use crate::matcher::{NameMatcher, normalize_app_name};
use crate::query::{AsyncCaskQuery, CaskQuery, PackageInfo, QueryError};
use crate::rate_limit::{self, RateLimiter};
use futures::StreamExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const CACHE_SOURCE: &str = "lookup";

/// What to find out about each application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    /// Whether a cask exists and can be installed
    Installable,
    /// The newest version Homebrew knows about
    LatestVersion,
}

impl LookupKind {
    fn cache_prefix(self) -> &'static str {
        match self {
            LookupKind::Installable => "installable",
            LookupKind::LatestVersion => "latest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupValue {
    Installable(bool),
    Latest(Option<String>),
}

/// Outcome for one queried application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResult {
    pub name: String,
    pub installed_version: String,
    pub matched_package_id: Option<String>,
    /// Match score (0-100) between the app name and the matched cask
    pub similarity: u8,
    /// `None` when the lookup failed
    pub value: Option<LookupValue>,
    pub error: Option<ErrorKind>,
}

impl LookupResult {
    pub fn failed(name: &str, version: &str, kind: ErrorKind) -> Self {
        Self {
            name: name.to_string(),
            installed_version: version.to_string(),
            matched_package_id: None,
            similarity: 0,
            value: None,
            error: Some(kind),
        }
    }

    pub fn is_installable(&self) -> bool {
        matches!(self.value, Some(LookupValue::Installable(true)))
    }

    pub fn latest_version(&self) -> Option<&str> {
        match &self.value {
            Some(LookupValue::Latest(Some(v))) => Some(v),
            _ => None,
        }
    }

    fn retryable_error(&self) -> Option<ErrorKind> {
        self.error.filter(|k| k.is_retryable())
    }
}

/// Cached part of a [`LookupResult`]; independent of the installed version.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedLookup {
    matched_package_id: Option<String>,
    similarity: u8,
    value: LookupValue,
}

/// Counts consecutive batches that failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounter {
    pub error_count: usize,
    pub max_errors: usize,
}

impl ErrorCounter {
    pub fn new(max_errors: usize) -> Self {
        Self {
            error_count: 0,
            max_errors: max_errors.max(1),
        }
    }

    /// Record a finished batch. Returns true once the threshold is reached.
    pub fn record(&mut self, batch: &[LookupResult]) -> bool {
        if batch_failed_uniformly(batch).is_some() {
            self.error_count += 1;
        } else {
            self.error_count = 0;
        }
        self.error_count >= self.max_errors
    }
}

/// The shared retryable error kind if every item in `batch` failed with it.
fn batch_failed_uniformly(batch: &[LookupResult]) -> Option<ErrorKind> {
    let first = batch.first()?.retryable_error()?;
    batch
        .iter()
        .all(|r| r.retryable_error() == Some(first))
        .then_some(first)
}

/// Lifecycle of one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub max_workers: usize,
    pub max_errors: usize,
    /// Minimum similarity for a fuzzy search candidate
    pub similarity_threshold: u8,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch.batch_size.max(1),
            max_workers: config.batch.max_workers.max(1),
            max_errors: config.batch.max_errors.max(1),
            similarity_threshold: config.matching.similarity_threshold,
        }
    }
}

/// Everything a single lookup needs besides the client.
#[derive(Clone)]
pub struct LookupContext {
    pub matcher: Arc<NameMatcher>,
    pub limiter: Arc<dyn RateLimiter>,
    pub cache: Option<Arc<TieredCache>>,
    pub similarity_threshold: u8,
}

impl LookupContext {
    pub fn new(
        matcher: Arc<NameMatcher>,
        limiter: Arc<dyn RateLimiter>,
        cache: Option<Arc<TieredCache>>,
        similarity_threshold: u8,
    ) -> Self {
        Self {
            matcher,
            limiter,
            cache,
            similarity_threshold,
        }
    }

    /// Same context with a different limiter (e.g. per-run rate override).
    pub fn with_limiter(&self, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            ..self.clone()
        }
    }

    /// Same context without cache access.
    pub fn without_cache(&self) -> Self {
        Self {
            cache: None,
            ..self.clone()
        }
    }

    fn cache_key(kind: LookupKind, token: &str) -> String {
        format!("{}:{}", kind.cache_prefix(), token)
    }

    fn cached(&self, app: &InstalledApp, token: &str, kind: LookupKind) -> Option<LookupResult> {
        let cache = self.cache.as_ref()?;
        let hit: CachedLookup = cache.get(&Self::cache_key(kind, token), CacheLevel::All, None)?;
        debug!(app = %app.name, "lookup served from cache");
        Some(LookupResult {
            name: app.name.clone(),
            installed_version: app.version.clone(),
            matched_package_id: hit.matched_package_id,
            similarity: hit.similarity,
            value: Some(hit.value),
            error: None,
        })
    }

    /// Report a call outcome to the limiter and pass it through.
    fn observe<T>(&self, outcome: std::result::Result<T, QueryError>) -> std::result::Result<T, QueryError> {
        self.limiter.feedback(outcome.is_ok());
        outcome
    }

    fn pick_candidate(&self, app: &InstalledApp, candidates: &[String]) -> Option<(String, u8)> {
        self.matcher
            .best_match(&app.name, candidates, self.similarity_threshold)
            .map(|(token, score)| (token.to_string(), score))
    }

    /// Turn a resolution into a result, caching successful outcomes.
    fn finish(
        &self,
        app: &InstalledApp,
        token: &str,
        kind: LookupKind,
        outcome: std::result::Result<Resolved, QueryError>,
    ) -> LookupResult {
        let resolved = match outcome {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!(app = %app.name, error = %e, "lookup failed");
                return LookupResult::failed(&app.name, &app.version, e.kind);
            }
        };

        let value = resolved.value(kind);
        if let Some(cache) = &self.cache {
            let entry = CachedLookup {
                matched_package_id: resolved.matched.clone(),
                similarity: resolved.similarity,
                value: value.clone(),
            };
            if let Err(e) = cache.put(
                &Self::cache_key(kind, token),
                &entry,
                CacheLevel::All,
                Priority::Normal,
                CACHE_SOURCE,
            ) {
                warn!(app = %app.name, error = %e, "failed to cache lookup");
            }
        }

        LookupResult {
            name: app.name.clone(),
            installed_version: app.version.clone(),
            matched_package_id: resolved.matched,
            similarity: resolved.similarity,
            value: Some(value),
            error: None,
        }
    }
}

/// What a lookup found before it is shaped into a [`LookupValue`].
#[derive(Debug, Default)]
struct Resolved {
    matched: Option<String>,
    similarity: u8,
    info: Option<PackageInfo>,
}

impl Resolved {
    fn exact(info: PackageInfo) -> Self {
        Self {
            matched: Some(info.token.clone()),
            similarity: 100,
            info: Some(info),
        }
    }

    fn fuzzy(candidate: String, score: u8, info: Option<PackageInfo>) -> Self {
        Self {
            matched: info.as_ref().map(|_| candidate),
            similarity: if info.is_some() { score } else { 0 },
            info,
        }
    }

    fn value(&self, kind: LookupKind) -> LookupValue {
        match kind {
            LookupKind::Installable => {
                LookupValue::Installable(self.info.as_ref().is_some_and(PackageInfo::is_installable))
            }
            LookupKind::LatestVersion => {
                LookupValue::Latest(self.info.as_ref().and_then(|i| i.version.clone()))
            }
        }
    }
}

/// Exact lookup, then fuzzy search + exact lookup of the best candidate.
fn lookup_chain_blocking<Q: CaskQuery + ?Sized>(
    client: &Q,
    ctx: &LookupContext,
    app: &InstalledApp,
    token: &str,
) -> std::result::Result<Resolved, QueryError> {
    if token.is_empty() {
        return Ok(Resolved::default());
    }
    ctx.limiter.wait();
    if let Some(info) = ctx.observe(client.lookup_exact(token))? {
        return Ok(Resolved::exact(info));
    }
    ctx.limiter.wait();
    let candidates = ctx.observe(client.search(token))?;
    let Some((candidate, score)) = ctx.pick_candidate(app, &candidates) else {
        return Ok(Resolved::default());
    };
    ctx.limiter.wait();
    let info = ctx.observe(client.lookup_exact(&candidate))?;
    Ok(Resolved::fuzzy(candidate, score, info))
}

/// Async mirror of [`lookup_chain_blocking`].
async fn lookup_chain_async<Q: AsyncCaskQuery + ?Sized>(
    client: &Q,
    ctx: &LookupContext,
    app: &InstalledApp,
    token: &str,
) -> std::result::Result<Resolved, QueryError> {
    if token.is_empty() {
        return Ok(Resolved::default());
    }
    rate_limit::wait_async(ctx.limiter.as_ref()).await;
    if let Some(info) = ctx.observe(client.lookup_exact(token).await)? {
        return Ok(Resolved::exact(info));
    }
    rate_limit::wait_async(ctx.limiter.as_ref()).await;
    let candidates = ctx.observe(client.search(token).await)?;
    let Some((candidate, score)) = ctx.pick_candidate(app, &candidates) else {
        return Ok(Resolved::default());
    };
    rate_limit::wait_async(ctx.limiter.as_ref()).await;
    let info = ctx.observe(client.lookup_exact(&candidate).await)?;
    Ok(Resolved::fuzzy(candidate, score, info))
}

fn resolve_blocking<Q: CaskQuery + ?Sized>(
    client: &Q,
    ctx: &LookupContext,
    app: &InstalledApp,
    kind: LookupKind,
) -> LookupResult {
    let token = normalize_app_name(&app.name);
    if let Some(hit) = ctx.cached(app, &token, kind) {
        return hit;
    }
    let outcome = lookup_chain_blocking(client, ctx, app, &token);
    ctx.finish(app, &token, kind, outcome)
}

async fn resolve_async<Q: AsyncCaskQuery + ?Sized>(
    client: &Q,
    ctx: &LookupContext,
    app: &InstalledApp,
    kind: LookupKind,
) -> LookupResult {
    let token = normalize_app_name(&app.name);
    if let Some(hit) = ctx.cached(app, &token, kind) {
        return hit;
    }
    let outcome = lookup_chain_async(client, ctx, app, &token).await;
    ctx.finish(app, &token, kind, outcome)
}

/// Run `items` batch by batch through `run_batch`, enforcing the error threshold.
fn run_batches<F>(
    strategy: &str,
    items: &[InstalledApp],
    settings: &BatchSettings,
    mut run_batch: F,
) -> Result<Vec<LookupResult>>
where
    F: FnMut(&[InstalledApp]) -> Result<Vec<LookupResult>>,
{
    let mut state = RunState::Pending;
    let mut counter = ErrorCounter::new(settings.max_errors);
    let mut results = Vec::with_capacity(items.len());
    let total_batches = items.len().div_ceil(settings.batch_size);

    for (index, batch) in items.chunks(settings.batch_size).enumerate() {
        if state == RunState::Pending {
            state = RunState::Running;
        }
        let batch_results = run_batch(batch)?;
        if batch_results.len() != batch.len() {
            return Err(TrackerError::Other(anyhow::anyhow!(
                "{} strategy returned {} results for a batch of {}",
                strategy,
                batch_results.len(),
                batch.len()
            )));
        }

        let failed = batch_failed_uniformly(&batch_results);
        let abort = counter.record(&batch_results);
        results.extend(batch_results);
        info!(
            strategy,
            batch = index + 1,
            total_batches,
            ?failed,
            error_count = counter.error_count,
            "batch finished"
        );

        if abort {
            state = RunState::Aborted;
            warn!(strategy, ?state, error_count = counter.error_count, "too many failed batches");
            return Err(TrackerError::BatchAborted {
                error_count: counter.error_count,
                partial: results,
            });
        }
    }

    state = RunState::Completed;
    debug!(strategy, ?state, results = results.len(), "run finished");
    Ok(results)
}

/// One way of executing a full batch run.
pub trait BatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, items: &[InstalledApp], kind: LookupKind, ctx: &LookupContext) -> Result<Vec<LookupResult>>;
}

/// Bounded OS thread pool over a blocking client.
pub struct ThreadPoolStrategy<Q> {
    client: Arc<Q>,
    settings: BatchSettings,
    pool: rayon::ThreadPool,
}

impl<Q: CaskQuery> ThreadPoolStrategy<Q> {
    pub fn new(client: Arc<Q>, settings: BatchSettings) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.max_workers.max(1))
            .thread_name(|i| format!("versiontracker-worker-{}", i))
            .build()
            .map_err(|e| TrackerError::Other(anyhow::anyhow!("cannot build worker pool: {}", e)))?;
        Ok(Self {
            client,
            settings,
            pool,
        })
    }
}

impl<Q: CaskQuery> BatchStrategy for ThreadPoolStrategy<Q> {
    fn name(&self) -> &'static str {
        "thread-pool"
    }

    fn run(&self, items: &[InstalledApp], kind: LookupKind, ctx: &LookupContext) -> Result<Vec<LookupResult>> {
        let client = self.client.as_ref();
        run_batches(self.name(), items, &self.settings, |batch| {
            // Indexed parallel collect keeps input order.
            Ok(self.pool.install(|| {
                batch
                    .par_iter()
                    .map(|app| resolve_blocking(client, ctx, app, kind))
                    .collect()
            }))
        })
    }
}

/// Single-threaded event loop, hosted on its own thread, over an async client.
///
/// The runtime is created on first use and kept for the strategy's lifetime
/// so that pooled HTTP connections stay bound to a live loop.
pub struct AsyncStrategy<Q> {
    client: Arc<Q>,
    settings: BatchSettings,
    concurrency: usize,
    runtime: Mutex<Option<Arc<tokio::runtime::Runtime>>>,
}

impl<Q: AsyncCaskQuery + 'static> AsyncStrategy<Q> {
    pub fn new(client: Arc<Q>, settings: BatchSettings, concurrency: usize) -> Self {
        Self {
            client,
            settings,
            concurrency: concurrency.max(1),
            runtime: Mutex::new(None),
        }
    }

    fn runtime(&self) -> Result<Arc<tokio::runtime::Runtime>> {
        let mut slot = self.runtime.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(runtime) = slot.as_ref() {
            return Ok(Arc::clone(runtime));
        }
        let runtime = Arc::new(
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?,
        );
        *slot = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    async fn run_batch(
        client: &Q,
        ctx: &LookupContext,
        batch: &[InstalledApp],
        kind: LookupKind,
        concurrency: usize,
    ) -> Vec<LookupResult> {
        let mut indexed: Vec<(usize, LookupResult)> = futures::stream::iter(batch.iter().enumerate())
            .map(|(i, app)| async move { (i, resolve_async(client, ctx, app, kind).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, result)| result).collect()
    }
}

impl<Q: AsyncCaskQuery + 'static> BatchStrategy for AsyncStrategy<Q> {
    fn name(&self) -> &'static str {
        "async"
    }

    fn run(&self, items: &[InstalledApp], kind: LookupKind, ctx: &LookupContext) -> Result<Vec<LookupResult>> {
        let runtime = self.runtime()?;
        let client = Arc::clone(&self.client);
        let ctx = ctx.clone();
        let items = items.to_vec();
        let settings = self.settings;
        let concurrency = self.concurrency;
        let name = self.name();

        // The loop runs on its own thread so callers never need to be inside a
        // runtime, and a runtime already active on the calling thread is left alone.
        let handle = std::thread::Builder::new()
            .name("versiontracker-async".into())
            .spawn(move || {
                run_batches(name, &items, &settings, |batch| {
                    Ok(runtime.block_on(Self::run_batch(&client, &ctx, batch, kind, concurrency)))
                })
            })?;

        handle
            .join()
            .map_err(|_| TrackerError::Other(anyhow::anyhow!("async worker thread panicked")))?
    }
}

impl<Q> Drop for AsyncStrategy<Q> {
    fn drop(&mut self) {
        let slot = self.runtime.get_mut().unwrap_or_else(|p| p.into_inner());
        // Dropping a runtime from inside another one panics; shutting down in the background never does.
        if let Some(runtime) = slot.take().and_then(|rt| Arc::try_unwrap(rt).ok()) {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(kind: Option<ErrorKind>) -> LookupResult {
        match kind {
            Some(k) => LookupResult::failed("app", "1.0", k),
            None => LookupResult {
                name: "app".into(),
                installed_version: "1.0".into(),
                matched_package_id: Some("app".into()),
                similarity: 100,
                value: Some(LookupValue::Installable(true)),
                error: None,
            },
        }
    }

    #[test]
    fn test_uniform_retryable_failure_counts() {
        let batch = vec![result(Some(ErrorKind::Timeout)), result(Some(ErrorKind::Timeout))];
        assert_eq!(batch_failed_uniformly(&batch), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_mixed_or_non_retryable_failures_do_not_count() {
        let mixed = vec![result(Some(ErrorKind::Timeout)), result(Some(ErrorKind::Network))];
        assert_eq!(batch_failed_uniformly(&mixed), None);

        let partial = vec![result(Some(ErrorKind::Timeout)), result(None)];
        assert_eq!(batch_failed_uniformly(&partial), None);

        let permission = vec![result(Some(ErrorKind::Permission))];
        assert_eq!(batch_failed_uniformly(&permission), None);

        assert_eq!(batch_failed_uniformly(&[]), None);
    }

    #[test]
    fn test_error_counter_resets_on_success() {
        let failed = vec![result(Some(ErrorKind::Network))];
        let ok = vec![result(None)];
        let mut counter = ErrorCounter::new(3);
        assert!(!counter.record(&failed));
        assert!(!counter.record(&failed));
        assert!(!counter.record(&ok));
        assert_eq!(counter.error_count, 0);
        assert!(!counter.record(&failed));
        assert!(!counter.record(&failed));
        assert!(counter.record(&failed));
    }

    #[test]
    fn test_run_batches_aborts_with_partial() {
        let items: Vec<InstalledApp> = (0..10).map(|i| InstalledApp::new(format!("app{i}"), "1")).collect();
        let settings = BatchSettings {
            batch_size: 2,
            max_workers: 1,
            max_errors: 3,
            similarity_threshold: 75,
        };
        let mut calls = 0;
        let err = run_batches("test", &items, &settings, |batch| {
            calls += 1;
            Ok(batch
                .iter()
                .map(|a| LookupResult::failed(&a.name, &a.version, ErrorKind::Tool))
                .collect())
        })
        .unwrap_err();

        assert_eq!(calls, 3);
        let partial = err.partial_results().unwrap();
        assert_eq!(partial.len(), 6);
        assert_eq!(partial[0].name, "app0");
        assert_eq!(partial[5].name, "app5");
    }

    #[test]
    fn test_run_batches_rejects_short_batch() {
        let items = vec![InstalledApp::new("a", "1"), InstalledApp::new("b", "1")];
        let err = run_batches("test", &items, &BatchSettings::default(), |_| Ok(vec![])).unwrap_err();
        assert!(matches!(err, TrackerError::Other(_)));
    }

    #[test]
    fn test_resolved_values() {
        let info = PackageInfo {
            token: "firefox".into(),
            name: vec![],
            desc: None,
            homepage: None,
            version: Some("120.0".into()),
            deprecated: false,
            disabled: false,
        };
        let exact = Resolved::exact(info.clone());
        assert_eq!(exact.value(LookupKind::Installable), LookupValue::Installable(true));
        assert_eq!(
            exact.value(LookupKind::LatestVersion),
            LookupValue::Latest(Some("120.0".into()))
        );

        let missed = Resolved::fuzzy("firefox".into(), 90, None);
        assert_eq!(missed.matched, None);
        assert_eq!(missed.similarity, 0);
        assert_eq!(missed.value(LookupKind::Installable), LookupValue::Installable(false));
    }
}
