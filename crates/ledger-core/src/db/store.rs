//! Local store lifecycle.
//!
//! `LocalStore` owns the decision of whether an embedded database is usable.
//! It never fails loudly: anything that prevents initialization (headless
//! runtime, unwritable storage, a failed migration) yields
//! [`StoreState::Unavailable`] and callers route through the remote instead.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::error::Result;

use super::Database;

const WRITE_CHECK_SUFFIX: &str = "-writecheck";
const SIDECAR_SUFFIXES: [&str; 4] = ["-wal", "-shm", "-journal", WRITE_CHECK_SUFFIX];

/// Where the process is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeContext {
    /// A device with a user; local storage is worth initializing
    Interactive,
    /// Server-side or batch context; no local I/O is attempted
    Headless,
}

impl RuntimeContext {
    /// Detect the context from `LEDGER_RUNTIME` (`server`/`headless` opt out)
    pub fn detect() -> Self {
        match std::env::var("LEDGER_RUNTIME")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "server" | "headless" => Self::Headless,
            _ => Self::Interactive,
        }
    }
}

/// Backing storage for the local database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// Shared handle to an initialized local database.
///
/// All local I/O goes through one connection behind an async mutex, so
/// writes to the same record are applied in order.
#[derive(Clone)]
pub struct LocalHandle {
    db: Arc<Mutex<Database>>,
}

impl LocalHandle {
    fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Acquire the connection
    pub async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    /// Whether both handles share the same initialization
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.db, &other.db)
    }
}

/// Memoized outcome of opening the local store
#[derive(Clone)]
pub enum StoreState {
    Ready(LocalHandle),
    Unavailable(String),
}

impl StoreState {
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Lifecycle object for the embedded store, passed to repositories explicitly
pub struct LocalStore {
    location: StoreLocation,
    context: RuntimeContext,
    init: StdMutex<Arc<OnceCell<StoreState>>>,
}

impl LocalStore {
    pub fn new(location: StoreLocation, context: RuntimeContext) -> Self {
        Self {
            location,
            context,
            init: StdMutex::new(Arc::new(OnceCell::new())),
        }
    }

    /// Interactive store backed by a file
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreLocation::File(path.into()), RuntimeContext::Interactive)
    }

    /// Interactive in-memory store (tests, throwaway sessions)
    pub fn in_memory() -> Self {
        Self::new(StoreLocation::Memory, RuntimeContext::Interactive)
    }

    /// A store that is never available; every repository runs remote-only
    pub fn disabled() -> Self {
        Self::new(StoreLocation::Memory, RuntimeContext::Headless)
    }

    pub const fn location(&self) -> &StoreLocation {
        &self.location
    }

    fn current_cell(&self) -> Arc<OnceCell<StoreState>> {
        let guard = self
            .init
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Open the store, initializing it on first use.
    ///
    /// Concurrent callers share one in-flight initialization and every later
    /// call returns the memoized state.
    pub async fn open(&self) -> StoreState {
        let cell = self.current_cell();
        cell.get_or_init(|| self.initialize()).await.clone()
    }

    /// The handle when the store is usable
    pub async fn ready(&self) -> Option<LocalHandle> {
        match self.open().await {
            StoreState::Ready(handle) => Some(handle),
            StoreState::Unavailable(_) => None,
        }
    }

    /// Whether an initialization already succeeded (never triggers one)
    pub fn is_ready(&self) -> bool {
        self.current_cell().get().is_some_and(StoreState::is_ready)
    }

    /// Drop the memoized state; the next `open` initializes again
    pub fn close(&self) {
        let mut guard = self
            .init
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(OnceCell::new());
    }

    /// Destructive re-initialization: close, then delete the database files
    pub async fn reset(&self) -> Result<()> {
        // Wait for in-flight work on the current handle to drain
        if let Some(StoreState::Ready(handle)) = self.current_cell().get().cloned() {
            drop(handle.lock().await);
        }
        self.close();

        if let StoreLocation::File(path) = &self.location {
            remove_database_files(path)?;
            tracing::warn!("Local store at {} was reset", path.display());
        }
        Ok(())
    }

    async fn initialize(&self) -> StoreState {
        if self.context == RuntimeContext::Headless {
            tracing::debug!("Headless runtime, local store disabled");
            return StoreState::Unavailable("headless runtime".to_string());
        }

        let opened = match &self.location {
            StoreLocation::File(path) => {
                if let Err(error) = check_storage_writable(path) {
                    tracing::warn!(
                        "Local storage at {} is not writable: {error}",
                        path.display()
                    );
                    return StoreState::Unavailable(format!("storage write check failed: {error}"));
                }
                Database::open(path).await
            }
            StoreLocation::Memory => Database::open_in_memory().await,
        };

        match opened {
            Ok(db) => {
                tracing::debug!("Local store ready");
                StoreState::Ready(LocalHandle::new(db))
            }
            Err(error) => {
                tracing::warn!("Local store initialization failed: {error}");
                StoreState::Unavailable(format!("initialization failed: {error}"))
            }
        }
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Check quota/permission problems before committing to initialization
fn check_storage_writable(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let marker = sidecar_path(path, WRITE_CHECK_SUFFIX);
    std::fs::write(&marker, b"ok")?;
    std::fs::remove_file(&marker)
}

fn remove_database_files(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    for suffix in SIDECAR_SUFFIXES {
        let sidecar = sidecar_path(path, suffix);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
    }
    Ok(())
}
