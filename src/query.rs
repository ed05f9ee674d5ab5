//! Single lookups against Homebrew.
//!
//! Two transports implement the same contract:
//!
//! - [`BrewCli`] shells out to the `brew` executable (synchronous path)
//! - [`HttpCaskClient`] talks to the Homebrew JSON API (asynchronous path)
//!
//! Both report failures as a [`QueryError`] carrying an [`ErrorKind`], and
//! both treat "no such cask" as `Ok(None)` / an empty search rather than an
//! error. Neither retries: callers decide what a failure means.

use crate::error::{ErrorKind, TrackerError};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Cask metadata, as returned by `brew info --cask --json=v2` and the JSON API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub token: String,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl PackageInfo {
    /// Disabled casks can no longer be installed.
    pub fn is_installable(&self) -> bool {
        !self.disabled
    }
}

/// A classified lookup failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<QueryError> for TrackerError {
    fn from(err: QueryError) -> Self {
        match err.kind {
            ErrorKind::Timeout => TrackerError::Timeout(err.message),
            ErrorKind::Network => TrackerError::Network(err.message),
            ErrorKind::Parse => TrackerError::DataParsing(err.message),
            ErrorKind::Permission | ErrorKind::ToolMissing | ErrorKind::Tool => {
                TrackerError::Tool(format!("{}: {}", err.kind, err.message))
            }
            ErrorKind::NotFound | ErrorKind::Unknown => TrackerError::Tool(err.to_string()),
        }
    }
}

/// Blocking lookup contract used by the thread-pool strategy.
pub trait CaskQuery: Send + Sync {
    /// `Ok(None)` when no cask has exactly this token.
    fn lookup_exact(&self, token: &str) -> Result<Option<PackageInfo>, QueryError>;

    /// Candidate tokens for a free-text query; empty when nothing matches.
    fn search(&self, query: &str) -> Result<Vec<String>, QueryError>;
}

/// Non-blocking lookup contract used by the event-loop strategy.
pub trait AsyncCaskQuery: Send + Sync {
    fn lookup_exact(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Option<PackageInfo>, QueryError>> + Send;

    fn search(&self, query: &str) -> impl Future<Output = Result<Vec<String>, QueryError>> + Send;
}

/// What the orchestrator needs to know about the local Homebrew install.
pub trait BrewEnvironment: Send + Sync {
    fn is_available(&self) -> bool;

    /// Tokens of casks already installed through Homebrew.
    fn installed_casks(&self) -> Result<Vec<String>, QueryError>;
}

/// Classify a failed `brew` invocation from its stderr.
pub fn classify_stderr(stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "no formulae or casks found",
        "no available cask",
        "no cask with this name",
        "no casks found",
        "cask unavailable",
    ]) {
        ErrorKind::NotFound
    } else if has(&["permission denied", "operation not permitted"]) {
        ErrorKind::Permission
    } else if has(&["timed out", "timeout"]) {
        ErrorKind::Timeout
    } else if has(&[
        "could not resolve host",
        "failed to connect",
        "network is unreachable",
        "connection refused",
        "connection reset",
        "no route to host",
    ]) {
        ErrorKind::Network
    } else {
        ErrorKind::Tool
    }
}

/// Classify a failure to run the executable at all.
pub fn classify_io(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::ToolMissing,
        std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    }
}

/// Classify a non-success HTTP status. 404 is handled by callers as "not found".
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::Permission,
        408 | 504 => ErrorKind::Timeout,
        429 | 500..=599 => ErrorKind::Network,
        _ => ErrorKind::Tool,
    }
}

fn classify_reqwest(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::Parse
    } else if err.is_connect() || err.is_request() {
        ErrorKind::Network
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else {
        ErrorKind::Unknown
    }
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    #[serde(default)]
    casks: Vec<PackageInfo>,
}

/// Parse `brew info --cask --json=v2` output.
pub fn parse_info_json(json: &str) -> Result<Option<PackageInfo>, QueryError> {
    let response: InfoResponse = serde_json::from_str(json)
        .map_err(|e| QueryError::new(ErrorKind::Parse, format!("brew info output: {}", e)))?;
    Ok(response.casks.into_iter().next())
}

/// Parse `brew search --cask` / `brew list --cask` output into tokens.
pub fn parse_token_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("==>"))
        .flat_map(|line| line.split_whitespace())
        .map(String::from)
        .collect()
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// `brew` subprocess client.
#[derive(Debug, Clone)]
pub struct BrewCli {
    brew: PathBuf,
    timeout: Duration,
}

impl Default for BrewCli {
    fn default() -> Self {
        Self::new("brew", DEFAULT_TIMEOUT)
    }
}

impl BrewCli {
    pub fn new(brew: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            brew: brew.into(),
            timeout,
        }
    }

    /// Run `brew` with `args`, killing it once the timeout elapses.
    fn run(&self, args: &[&str]) -> Result<CommandOutput, QueryError> {
        tracing::debug!(brew = %self.brew.display(), ?args, "running brew");
        let mut child = Command::new(&self.brew)
            .args(args)
            .env("HOMEBREW_NO_AUTO_UPDATE", "1")
            .env("HOMEBREW_NO_ANALYTICS", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| QueryError::new(classify_io(&e), format!("{}: {}", self.brew.display(), e)))?;

        // Drain pipes on their own threads so a chatty child cannot block on a full pipe.
        let stdout = child.stdout.take().map(Drain::spawn);
        let stderr = child.stderr.take().map(Drain::spawn);
        let collect = |drain: Option<Drain>| drain.map(|d| d.collect(DRAIN_GRACE)).unwrap_or_default();

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    collect(stdout);
                    collect(stderr);
                    return Err(QueryError::new(
                        ErrorKind::Timeout,
                        format!("brew {} timed out after {:?}", args.join(" "), self.timeout),
                    ));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(QueryError::new(classify_io(&e), e.to_string())),
            }
        };

        Ok(CommandOutput {
            success: status.success(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

/// Background reader for one child pipe.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: std::thread::JoinHandle<()>,
}

impl Drain {
    fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });
        Self { buf, handle }
    }

    /// Output read so far, after waiting up to `grace` for end of stream.
    ///
    /// A grandchild can keep the pipe open after `brew` itself is gone; its
    /// reader is then left to finish on its own and only what arrived in
    /// time is returned.
    fn collect(self, grace: Duration) -> String {
        let deadline = Instant::now() + grace;
        while !self.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        } else {
            tracing::debug!("brew output pipe still open, abandoning reader");
        }
        let bytes = std::mem::take(&mut *self.buf.lock().unwrap_or_else(|p| p.into_inner()));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl CaskQuery for BrewCli {
    fn lookup_exact(&self, token: &str) -> Result<Option<PackageInfo>, QueryError> {
        let output = self.run(&["info", "--cask", token, "--json=v2"])?;
        if output.success {
            return parse_info_json(&output.stdout);
        }
        match classify_stderr(&output.stderr) {
            ErrorKind::NotFound => Ok(None),
            kind => Err(QueryError::new(kind, output.stderr.trim())),
        }
    }

    fn search(&self, query: &str) -> Result<Vec<String>, QueryError> {
        let output = self.run(&["search", "--cask", query])?;
        if output.success {
            return Ok(parse_token_lines(&output.stdout));
        }
        match classify_stderr(&output.stderr) {
            ErrorKind::NotFound => Ok(Vec::new()),
            kind => Err(QueryError::new(kind, output.stderr.trim())),
        }
    }
}

impl BrewEnvironment for BrewCli {
    fn is_available(&self) -> bool {
        self.run(&["--version"])
            .map(|output| output.success)
            .unwrap_or(false)
    }

    fn installed_casks(&self) -> Result<Vec<String>, QueryError> {
        let output = self.run(&["list", "--cask"])?;
        if output.success {
            Ok(parse_token_lines(&output.stdout))
        } else {
            Err(QueryError::new(classify_stderr(&output.stderr), output.stderr.trim()))
        }
    }
}

/// Homebrew JSON API client with in-memory caching of cask lookups.
#[derive(Clone)]
pub struct HttpCaskClient {
    client: reqwest::Client,
    base_url: String,
    cask_cache: moka::future::Cache<String, Option<PackageInfo>>,
    all_casks: Arc<tokio::sync::OnceCell<Arc<Vec<PackageInfo>>>>,
}

impl HttpCaskClient {
    pub fn new(base_url: &str, timeout: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(format!("versiontracker/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            // Lasts for one run; sized for a typical /Applications folder
            cask_cache: moka::future::Cache::new(500),
            all_casks: Arc::new(tokio::sync::OnceCell::new()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>, QueryError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| QueryError::new(classify_reqwest(&e), e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(QueryError::new(
                classify_status(status.as_u16()),
                format!("GET {} returned {}", url, status),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QueryError::new(classify_reqwest(&e), e.to_string()))?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| QueryError::new(ErrorKind::Parse, format!("{}: {}", url, e)))
    }

    async fn fetch_all_casks(&self) -> Result<Arc<Vec<PackageInfo>>, QueryError> {
        self.all_casks
            .get_or_try_init(|| async {
                let url = format!("{}/cask.json", self.base_url);
                let casks: Vec<PackageInfo> = self.get_json(&url).await?.ok_or_else(|| {
                    QueryError::new(ErrorKind::Tool, format!("{} not found", url))
                })?;
                tracing::debug!(count = casks.len(), "fetched cask index");
                Ok::<_, QueryError>(Arc::new(casks))
            })
            .await
            .cloned()
    }
}

impl AsyncCaskQuery for HttpCaskClient {
    async fn lookup_exact(&self, token: &str) -> Result<Option<PackageInfo>, QueryError> {
        if let Some(cached) = self.cask_cache.get(token).await {
            return Ok(cached);
        }
        let url = format!("{}/cask/{}.json", self.base_url, token);
        let cask: Option<PackageInfo> = self.get_json(&url).await?;
        self.cask_cache.insert(token.to_string(), cask.clone()).await;
        Ok(cask)
    }

    async fn search(&self, query: &str) -> Result<Vec<String>, QueryError> {
        let casks = self.fetch_all_casks().await?;
        Ok(filter_casks(&casks, query))
    }
}

/// Tokens whose token or display name contains `query` (case-insensitive).
pub fn filter_casks(casks: &[PackageInfo], query: &str) -> Vec<String> {
    let query = query.to_lowercase();
    casks
        .iter()
        .filter(|c| {
            c.token.to_lowercase().contains(&query)
                || c.name.iter().any(|n| n.to_lowercase().contains(&query))
        })
        .map(|c| c.token.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stderr() {
        assert_eq!(
            classify_stderr("Error: No formulae or casks found for \"nope\"."),
            ErrorKind::NotFound
        );
        assert_eq!(
            classify_stderr("Error: Cask 'x' is unavailable: No Cask with this name exists."),
            ErrorKind::NotFound
        );
        assert_eq!(classify_stderr("curl: (6) Could not resolve host: github.com"), ErrorKind::Network);
        assert_eq!(classify_stderr("Error: Permission denied @ rb_sysopen"), ErrorKind::Permission);
        assert_eq!(classify_stderr("Operation timed out"), ErrorKind::Timeout);
        assert_eq!(classify_stderr("Error: something odd"), ErrorKind::Tool);
    }

    #[test]
    fn test_classify_io() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no brew");
        assert_eq!(classify_io(&missing), ErrorKind::ToolMissing);
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(classify_io(&denied), ErrorKind::Permission);
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(404), ErrorKind::NotFound);
        assert_eq!(classify_status(403), ErrorKind::Permission);
        assert_eq!(classify_status(504), ErrorKind::Timeout);
        assert_eq!(classify_status(503), ErrorKind::Network);
        assert_eq!(classify_status(418), ErrorKind::Tool);
    }

    #[test]
    fn test_parse_info_json() {
        let json = r#"{"formulae": [], "casks": [{"token": "firefox", "name": ["Mozilla Firefox"], "version": "120.0.1", "desc": "Web browser"}]}"#;
        let info = parse_info_json(json).unwrap().unwrap();
        assert_eq!(info.token, "firefox");
        assert_eq!(info.version.as_deref(), Some("120.0.1"));
        assert!(info.is_installable());

        assert_eq!(parse_info_json(r#"{"casks": []}"#).unwrap(), None);
        let err = parse_info_json("not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[test]
    fn test_parse_token_lines() {
        let out = "==> Casks\ngoogle-chrome\ngoogle-chrome@beta   chromium\n\n";
        assert_eq!(
            parse_token_lines(out),
            vec!["google-chrome", "google-chrome@beta", "chromium"]
        );
    }

    #[test]
    fn test_filter_casks() {
        let casks = vec![
            PackageInfo {
                token: "google-chrome".into(),
                name: vec!["Google Chrome".into()],
                desc: None,
                homepage: None,
                version: Some("120.0".into()),
                deprecated: false,
                disabled: false,
            },
            PackageInfo {
                token: "firefox".into(),
                name: vec!["Mozilla Firefox".into()],
                desc: None,
                homepage: None,
                version: None,
                deprecated: false,
                disabled: true,
            },
        ];
        assert_eq!(filter_casks(&casks, "Chrome"), vec!["google-chrome"]);
        assert_eq!(filter_casks(&casks, "mozilla"), vec!["firefox"]);
        assert!(filter_casks(&casks, "safari").is_empty());
        assert!(!casks[1].is_installable());
    }

    #[test]
    fn test_query_error_conversion() {
        let err: TrackerError = QueryError::new(ErrorKind::Timeout, "slow").into();
        assert!(matches!(err, TrackerError::Timeout(_)));
        let err: TrackerError = QueryError::new(ErrorKind::ToolMissing, "brew").into();
        assert!(matches!(err, TrackerError::Tool(_)));
    }

    #[test]
    fn test_missing_brew_is_tool_missing() {
        let cli = BrewCli::new("/nonexistent/brew-binary", Duration::from_secs(1));
        let err = CaskQuery::search(&cli, "firefox").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolMissing);
        assert!(!cli.is_available());
    }

    #[cfg(unix)]
    mod fake_brew {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn fake_brew(script: &str) -> (TempDir, BrewCli) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("brew");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            let cli = BrewCli::new(path, Duration::from_millis(500));
            (dir, cli)
        }

        #[test]
        fn test_lookup_exact_success() {
            let (_dir, cli) = fake_brew(
                r#"echo '{"casks":[{"token":"firefox","version":"120.0.1"}]}'"#,
            );
            let info = CaskQuery::lookup_exact(&cli, "firefox").unwrap().unwrap();
            assert_eq!(info.version.as_deref(), Some("120.0.1"));
        }

        #[test]
        fn test_not_found_is_none() {
            let (_dir, cli) = fake_brew(
                r#"echo 'Error: No available cask with the name "nope".' >&2; exit 1"#,
            );
            assert_eq!(CaskQuery::lookup_exact(&cli, "nope").unwrap(), None);
        }

        #[test]
        fn test_search_no_results_is_empty() {
            let (_dir, cli) = fake_brew(
                r#"echo 'Error: No formulae or casks found for "zzz".' >&2; exit 1"#,
            );
            assert!(CaskQuery::search(&cli, "zzz").unwrap().is_empty());
        }

        #[test]
        fn test_other_failure_is_error() {
            let (_dir, cli) = fake_brew(r#"echo 'curl: Failed to connect to github.com' >&2; exit 1"#);
            let err = CaskQuery::search(&cli, "x").unwrap_err();
            assert_eq!(err.kind, ErrorKind::Network);
        }

        #[test]
        fn test_timeout_kills_child() {
            let (_dir, cli) = fake_brew("sleep 5");
            let started = Instant::now();
            let err = CaskQuery::search(&cli, "x").unwrap_err();
            assert_eq!(err.kind, ErrorKind::Timeout);
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[test]
        fn test_timeout_with_grandchild_holding_pipes() {
            let (_dir, cli) = fake_brew("sleep 10 & sleep 10");
            let started = Instant::now();
            let err = CaskQuery::search(&cli, "x").unwrap_err();
            assert_eq!(err.kind, ErrorKind::Timeout);
            // Kill, then at most one grace period per pipe
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[test]
        fn test_output_kept_when_background_child_outlives_brew() {
            let (_dir, cli) = fake_brew(r#"(sleep 10) & printf 'firefox\n'"#);
            let started = Instant::now();
            assert_eq!(cli.installed_casks().unwrap(), vec!["firefox"]);
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[test]
        fn test_installed_casks() {
            let (_dir, cli) = fake_brew(r#"printf 'firefox\nslack\n'"#);
            assert!(cli.is_available());
            assert_eq!(cli.installed_casks().unwrap(), vec!["firefox", "slack"]);
        }
    }

    mod http {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        struct Route {
            path: &'static str,
            status: u16,
            body: &'static str,
            delay: Duration,
        }

        fn route(path: &'static str, status: u16, body: &'static str) -> Route {
            Route {
                path,
                status,
                body,
                delay: Duration::ZERO,
            }
        }

        /// Serve canned responses on a local port; unknown paths get a 404.
        async fn serve(routes: Vec<Route>) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let routes = Arc::new(routes);
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut chunk = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match stream.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&chunk[..n]),
                            }
                        }
                        let request = String::from_utf8_lossy(&request);
                        let path = request.split_whitespace().nth(1).unwrap_or("/");
                        let (status, body, delay) = routes
                            .iter()
                            .find(|r| r.path == path)
                            .map_or((404, "", Duration::ZERO), |r| (r.status, r.body, r.delay));
                        tokio::time::sleep(delay).await;
                        let response = format!(
                            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    });
                }
            });
            format!("http://{addr}")
        }

        fn client(base: &str) -> HttpCaskClient {
            HttpCaskClient::new(base, Duration::from_secs(2)).unwrap()
        }

        const FIREFOX: &str = r#"{"token":"firefox","name":["Mozilla Firefox"],"version":"120.0.1"}"#;

        #[tokio::test]
        async fn test_lookup_exact_success() {
            let base = serve(vec![route("/cask/firefox.json", 200, FIREFOX)]).await;
            let info = AsyncCaskQuery::lookup_exact(&client(&base), "firefox")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(info.token, "firefox");
            assert_eq!(info.version.as_deref(), Some("120.0.1"));
        }

        #[tokio::test]
        async fn test_not_found_is_none() {
            let base = serve(Vec::new()).await;
            let found = AsyncCaskQuery::lookup_exact(&client(&base), "nope").await.unwrap();
            assert_eq!(found, None);
        }

        #[tokio::test]
        async fn test_status_codes_are_classified() {
            let base = serve(vec![
                route("/cask/busy.json", 503, ""),
                route("/cask/locked.json", 403, ""),
            ])
            .await;
            let client = client(&base);

            let err = AsyncCaskQuery::lookup_exact(&client, "busy").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Network);
            let err = AsyncCaskQuery::lookup_exact(&client, "locked").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Permission);
        }

        #[tokio::test]
        async fn test_malformed_body_is_parse_error() {
            let base = serve(vec![route("/cask/firefox.json", 200, "{not json")]).await;
            let err = AsyncCaskQuery::lookup_exact(&client(&base), "firefox")
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Parse);
        }

        #[tokio::test]
        async fn test_slow_server_times_out() {
            let slow = Route {
                delay: Duration::from_secs(5),
                ..route("/cask/firefox.json", 200, FIREFOX)
            };
            let base = serve(vec![slow]).await;
            let client = HttpCaskClient::new(&base, Duration::from_millis(200)).unwrap();

            let started = Instant::now();
            let err = AsyncCaskQuery::lookup_exact(&client, "firefox").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Timeout);
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[tokio::test]
        async fn test_search_filters_cask_index() {
            let index = r#"[
                {"token":"firefox","name":["Mozilla Firefox"],"version":"120.0.1"},
                {"token":"google-chrome","name":["Google Chrome"],"version":"120.0"}
            ]"#;
            let base = serve(vec![route("/cask.json", 200, index)]).await;
            let client = client(&base);

            assert_eq!(AsyncCaskQuery::search(&client, "chrome").await.unwrap(), vec!["google-chrome"]);
            assert!(AsyncCaskQuery::search(&client, "safari").await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_missing_cask_index_is_tool_error() {
            let base = serve(Vec::new()).await;
            let err = AsyncCaskQuery::search(&client(&base), "firefox").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Tool);
        }
    }
}
