// src/repository/mod.rs

//! Repository management and metadata fetching
//!
//! This module provides functionality for:
//! - Managing configured repositories in the system database
//! - Fetching repository metadata over HTTP or from a local mirror
//! - Bounded, throttled and cancellable transfers with retries
//!
//! Remote layout, per repository under `<url>/<product>/<branch>/`:
//! - `packages.checksum`: hex SHA-256 of the canonical snapshot
//! - `packages.json.zst`: zstd-compressed snapshot (EAPI 2)
//! - `packages.json`: plain snapshot (EAPI 1)
//! - `deltas/<base-checksum>.delta.zst`: differential update (EAPI 3)

pub mod delta;
pub mod mirror;
pub mod sync;

use crate::branch::validate_name;
use crate::db::models::Repository;
use crate::error::{Error, Result};
use crate::settings::Settings;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use rusqlite::Connection;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CHECKSUM_FILE: &str = "packages.checksum";
pub const SNAPSHOT_ZST_FILE: &str = "packages.json.zst";
pub const SNAPSHOT_FILE: &str = "packages.json";
pub const DELTA_DIR: &str = "deltas";

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// Path of a remote file relative to the repository URL
pub fn remote_path(product: &str, branch: &str, file: &str) -> String {
    format!("{}/{}/{}", product, branch, file)
}

/// Path of the delta leading away from `base`
pub fn delta_file(base: &str) -> String {
    format!("{}/{}.delta.zst", DELTA_DIR, base)
}

/// Shared flag aborting in-flight transfers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Reader enforcing a byte rate and observing a cancellation token
pub struct ThrottledReader<R> {
    inner: R,
    /// Bytes per second
    limit: Option<u64>,
    started: Instant,
    transferred: u64,
    cancel: CancelToken,
}

impl<R: Read> ThrottledReader<R> {
    /// `limit_kib` is in KiB/s; `None` reads at full speed
    pub fn new(inner: R, limit_kib: Option<u64>, cancel: CancelToken) -> Self {
        Self {
            inner,
            limit: limit_kib.map(|kib| kib.max(1) * 1024),
            started: Instant::now(),
            transferred: 0,
            cancel,
        }
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("transfer cancelled"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Keep single reads small enough for the limit to bite
        let len = match self.limit {
            Some(limit) => buf.len().min(limit as usize / 4).max(1),
            None => buf.len(),
        };
        let n = self.inner.read(&mut buf[..len])?;
        self.transferred += n as u64;

        if let Some(limit) = self.limit {
            let due = Duration::from_secs_f64(self.transferred as f64 / limit as f64);
            let elapsed = self.started.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }
        Ok(n)
    }
}

/// A place repository metadata is fetched from
pub trait RemoteSource: Send + Sync {
    /// Human-readable location, for logs
    fn describe(&self) -> String;

    /// Fetch a file relative to the repository root; `None` if absent
    fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Open the source behind a repository URL
///
/// `http://` and `https://` go through `RepositoryClient`; `file://` URLs
/// and absolute paths are read from disk.
pub fn open_source(url: &str, settings: &Settings, cancel: CancelToken) -> Result<Box<dyn RemoteSource>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(RepositoryClient::new(url, settings, cancel)?));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(LocalSource::new(path, settings, cancel)));
    }
    if url.starts_with('/') {
        return Ok(Box::new(LocalSource::new(url, settings, cancel)));
    }
    Err(Error::ParseError(format!("Unsupported repository URL: {}", url)))
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    base_url: String,
    max_retries: u32,
    timeout: Duration,
    speed_limit: Option<u64>,
    cancel: CancelToken,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new(base_url: &str, settings: &Settings, cancel: CancelToken) -> Result<Self> {
        let timeout = settings.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: settings.download_retries.max(1),
            timeout,
            speed_limit: settings.download_speed_limit,
            cancel,
        })
    }

    /// Fetch a URL with retry support; 404 yields `None`
    pub fn fetch_url(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.cancel.check()?;

            match self.fetch_once(url) {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!("Fetch attempt {} of {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fetch_once(&self, url: &str) -> Result<Option<Vec<u8>>> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                Error::FetchTimeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                }
            } else {
                Error::DownloadError(format!("{}: {}", url, e))
            }
        })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let mut reader = ThrottledReader::new(response, self.speed_limit, self.cancel.clone());
        let mut body = Vec::new();
        reader.read_to_end(&mut body).map_err(|e| {
            if self.cancel.is_cancelled() {
                return Error::Cancelled;
            }
            let timed_out = e.kind() == io::ErrorKind::TimedOut
                || e.get_ref()
                    .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                    .is_some_and(|re| re.is_timeout());
            if timed_out {
                Error::FetchTimeout {
                    url: url.to_string(),
                    timeout: self.timeout,
                }
            } else {
                Error::DownloadError(format!("Failed to read {}: {}", url, e))
            }
        })?;

        Ok(Some(body))
    }
}

impl RemoteSource for RepositoryClient {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.fetch_url(&format!("{}/{}", self.base_url, path))
    }
}

/// Mirror directory on the local filesystem
pub struct LocalSource {
    root: PathBuf,
    speed_limit: Option<u64>,
    cancel: CancelToken,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>, settings: &Settings, cancel: CancelToken) -> Self {
        Self {
            root: root.into(),
            speed_limit: settings.download_speed_limit,
            cancel,
        }
    }
}

impl RemoteSource for LocalSource {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.cancel.check()?;
        let file = match fs::File::open(self.root.join(path)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut reader = ThrottledReader::new(file, self.speed_limit, self.cancel.clone());
        let mut body = Vec::new();
        reader.read_to_end(&mut body).map_err(|e| {
            if self.cancel.is_cancelled() {
                Error::Cancelled
            } else {
                Error::IoError(format!("Failed to read {}: {}", path, e))
            }
        })?;
        Ok(Some(body))
    }
}

/// Add a new repository to the system database
pub fn add_repository(
    conn: &Connection,
    name: String,
    url: String,
    branch: String,
    priority: i32,
) -> Result<Repository> {
    validate_name(&name)
        .map_err(|_| Error::ParseError(format!("Invalid repository name: {}", name)))?;
    validate_name(&branch)?;

    // Check if repository with this name already exists
    if Repository::find_by_name(conn, &name)?.is_some() {
        return Err(Error::ConflictError(format!(
            "Repository '{}' already exists",
            name
        )));
    }

    let mut repo = Repository::new(name, url, branch);
    repo.priority = priority;

    repo.insert(conn)?;

    info!("Added repository: {} ({})", repo.name, repo.url);
    Ok(repo)
}

/// Remove a repository from the system database
pub fn remove_repository(conn: &Connection, name: &str) -> Result<Repository> {
    let repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))?;

    if let Some(id) = repo.id {
        Repository::delete(conn, id)?;
    }
    info!("Removed repository: {}", name);
    Ok(repo)
}

/// Enable or disable a repository
pub fn set_repository_enabled(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
    let mut repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))?;

    repo.enabled = enabled;
    repo.update(conn)?;

    info!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Toggle differential (EAPI 3) updates for a repository
pub fn set_differential_update(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
    let mut repo = Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFoundError(format!("Repository '{}' not found", name)))?;

    repo.differential_update = enabled;
    repo.update(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use std::io::Cursor;
    use std::net::TcpListener;
    use tempfile::{NamedTempFile, TempDir};

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn add(conn: &Connection, name: &str) -> Result<Repository> {
        add_repository(
            conn,
            name.to_string(),
            "https://example.com/repo".to_string(),
            "5".to_string(),
            10,
        )
    }

    #[test]
    fn test_add_repository() {
        let (_temp, conn) = create_test_db();

        let repo = add(&conn, "test-repo").unwrap();

        assert_eq!(repo.name, "test-repo");
        assert_eq!(repo.url, "https://example.com/repo");
        assert_eq!(repo.branch, "5");
        assert!(repo.enabled);
        assert_eq!(repo.priority, 10);
    }

    #[test]
    fn test_add_duplicate_repository() {
        let (_temp, conn) = create_test_db();

        add(&conn, "test-repo").unwrap();
        let result = add(&conn, "test-repo");
        assert!(matches!(result, Err(Error::ConflictError(_))));

        assert!(add(&conn, "../escape").is_err());
    }

    #[test]
    fn test_remove_repository() {
        let (_temp, conn) = create_test_db();

        add(&conn, "test-repo").unwrap();
        remove_repository(&conn, "test-repo").unwrap();

        let found = Repository::find_by_name(&conn, "test-repo").unwrap();
        assert!(found.is_none());
        assert!(matches!(
            remove_repository(&conn, "test-repo"),
            Err(Error::NotFoundError(_))
        ));
    }

    #[test]
    fn test_enable_disable_repository() {
        let (_temp, conn) = create_test_db();

        add(&conn, "test-repo").unwrap();

        // Disable
        set_repository_enabled(&conn, "test-repo", false).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(!repo.enabled);
        assert!(Repository::list_enabled(&conn).unwrap().is_empty());

        // Enable
        set_repository_enabled(&conn, "test-repo", true).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(repo.enabled);

        set_differential_update(&conn, "test-repo", false).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(!repo.differential_update);
    }

    #[test]
    fn test_open_source_schemes() {
        let settings = Settings::default();
        let cancel = CancelToken::new();
        assert!(open_source("file:///srv/mirror", &settings, cancel.clone()).is_ok());
        assert!(open_source("/srv/mirror", &settings, cancel.clone()).is_ok());
        assert!(open_source("https://example.com", &settings, cancel.clone()).is_ok());
        assert!(matches!(
            open_source("ftp://example.com", &settings, cancel),
            Err(Error::ParseError(_))
        ));
    }

    #[test]
    fn test_local_source_fetch() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("standard/5")).unwrap();
        fs::write(dir.path().join("standard/5/packages.checksum"), b"abc\n").unwrap();

        let cancel = CancelToken::new();
        let source = LocalSource::new(dir.path(), &Settings::default(), cancel.clone());
        let path = remote_path("standard", "5", CHECKSUM_FILE);
        assert_eq!(source.fetch(&path).unwrap().unwrap(), b"abc\n");
        assert!(source.fetch("standard/5/missing").unwrap().is_none());

        cancel.cancel();
        assert!(matches!(source.fetch(&path), Err(Error::Cancelled)));
    }

    #[test]
    fn test_throttled_reader_limits_rate() {
        let data = vec![7u8; 8 * 1024];
        let mut reader = ThrottledReader::new(Cursor::new(data), Some(16), CancelToken::new());

        let started = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out.len(), 8 * 1024);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_throttled_reader_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut reader = ThrottledReader::new(Cursor::new(vec![1u8; 16]), None, cancel);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }

    #[test]
    fn test_http_fetch_times_out() {
        // Accepts connections (via the backlog) but never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let settings = Settings {
            download_timeout: 1,
            download_retries: 1,
            ..Settings::default()
        };
        let client = RepositoryClient::new(&url, &settings, CancelToken::new()).unwrap();
        let err = client.fetch(CHECKSUM_FILE).unwrap_err();
        assert!(matches!(err, Error::FetchTimeout { .. }), "{}", err);
        assert!(err.is_retryable());
        drop(listener);
    }
}
