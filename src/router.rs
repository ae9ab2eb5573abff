//! Backend selection: capability probing, routing, legacy migration.
//!
//! A [`CapabilityResolver`] owns the process-wide environment facts: whether
//! a data directory exists at all, whether the process is keyed for the
//! secure store, and whether the durable backend actually opens. The probe
//! runs at most once per process; concurrent callers await the in-flight
//! probe. A [`PersistenceRouter`] binds a resolver to one cell's backend
//! preference and picks the medium every persistence operation goes to.
//!
//! Selection precedence:
//! 1. no usable data directory - persistence is a no-op
//! 2. master key configured - secure store only
//! 3. durable preferred and the database opened - SQLite
//! 4. otherwise - local file store

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use base64::Engine;

use crate::backend::{Backend, StoredRecord};
use crate::local::LocalStore;
use crate::secure::{SecureStore, KEY_BYTES};
use crate::sqlite::SqliteStore;

const DATA_DIR_ENV: &str = "STATECELL_DATA_DIR";
const MASTER_KEY_ENV: &str = "STATECELL_MASTER_KEY";

const DURABLE_FILE: &str = "cells.db";
const LOCAL_FILE: &str = "local-store.json";
const SECURE_DIR: &str = "secure";

/// Which durable medium a cell prefers when more than one is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Prefer the SQLite record store (the default).
    #[default]
    Durable,
    /// Use the synchronous local file store directly.
    Local,
}

/// Storage environment configuration.
///
/// `data_dir: None` means the environment cannot host persistence at all;
/// every cell then satisfies only the in-memory contract.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Root directory for all backends.
    pub data_dir: Option<PathBuf>,
    /// Master key for the secure store. Presence marks the process as a
    /// native-secure platform: the secure store is then used exclusively.
    pub master_key: Option<[u8; KEY_BYTES]>,
}

impl StorageConfig {
    /// Configuration with persistence disabled entirely.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Configuration rooted at an explicit directory.
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            master_key: None,
        }
    }

    /// Attach a secure-store master key.
    pub fn with_master_key(mut self, key: [u8; KEY_BYTES]) -> Self {
        self.master_key = Some(key);
        self
    }

    /// Resolve configuration from the environment: `STATECELL_DATA_DIR`
    /// (else the platform data directory), and `STATECELL_MASTER_KEY`
    /// (base64, 32 bytes).
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| {
                directories::ProjectDirs::from("", "", "statecell")
                    .map(|dirs| dirs.data_dir().to_path_buf())
            });

        let master_key = std::env::var(MASTER_KEY_ENV).ok().and_then(|raw| {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(raw.trim())
                .ok()?;
            match <[u8; KEY_BYTES]>::try_from(decoded.as_slice()) {
                Ok(key) => Some(key),
                Err(_) => {
                    warn!("{MASTER_KEY_ENV} is not {KEY_BYTES} bytes of base64, ignoring");
                    None
                }
            }
        });

        Self {
            data_dir,
            master_key,
        }
    }
}

/// What kind of host the probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// No usable data directory; persistence degrades to no-ops.
    Unavailable,
    /// Regular host: durable and/or local stores.
    Hosted,
    /// Secure-keyed host: secure store exclusively.
    Native,
}

/// The probe result: which backends this process can reach.
pub struct Capabilities {
    platform: Platform,
    durable: Option<Arc<SqliteStore>>,
    local: Option<Arc<LocalStore>>,
    secure: Option<Arc<SecureStore>>,
}

impl Capabilities {
    fn unavailable() -> Self {
        Self {
            platform: Platform::Unavailable,
            durable: None,
            local: None,
            secure: None,
        }
    }

    /// The detected platform kind.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// The durable record store, if it opened.
    pub fn durable(&self) -> Option<&Arc<SqliteStore>> {
        self.durable.as_ref()
    }

    /// The local file store, if the host has one.
    pub fn local(&self) -> Option<&Arc<LocalStore>> {
        self.local.as_ref()
    }

    /// The secure store, if the host is secure-keyed.
    pub fn secure(&self) -> Option<&Arc<SecureStore>> {
        self.secure.as_ref()
    }
}

/// Process-wide capability state with a single-flight async probe.
///
/// Construct one per process (or per test) and share it across routers; the
/// global default is resolved from the environment on first use.
pub struct CapabilityResolver {
    config: StorageConfig,
    resolved: OnceCell<Capabilities>,
}

impl CapabilityResolver {
    /// Create a resolver for the given configuration. The probe does not run
    /// until the first [`resolve`](Self::resolve) call.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            resolved: OnceCell::new(),
        }
    }

    /// The process-wide resolver, configured from the environment.
    pub fn global() -> Arc<CapabilityResolver> {
        static GLOBAL: OnceLock<Arc<CapabilityResolver>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(CapabilityResolver::new(StorageConfig::from_env())))
            .clone()
    }

    /// Resolve capabilities, probing on first call. Concurrent callers await
    /// the same in-flight probe; later callers get the memoized result.
    pub async fn resolve(&self) -> &Capabilities {
        self.resolved
            .get_or_init(|| Self::probe(&self.config))
            .await
    }

    /// Whether the probe has completed.
    pub fn probed(&self) -> bool {
        self.resolved.initialized()
    }

    async fn probe(config: &StorageConfig) -> Capabilities {
        let Some(dir) = &config.data_dir else {
            info!("no data directory configured; persistence disabled");
            return Capabilities::unavailable();
        };
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), %err, "data directory unusable; persistence disabled");
            return Capabilities::unavailable();
        }

        if let Some(key) = config.master_key {
            debug!(dir = %dir.display(), "secure platform detected");
            return Capabilities {
                platform: Platform::Native,
                durable: None,
                local: None,
                secure: Some(Arc::new(SecureStore::new(dir.join(SECURE_DIR), key))),
            };
        }

        let durable = match SqliteStore::open(dir.join(DURABLE_FILE)).await {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                warn!(%err, "durable backend unavailable, falling back to local store");
                None
            }
        };

        Capabilities {
            platform: Platform::Hosted,
            durable,
            local: Some(Arc::new(LocalStore::new(dir.join(LOCAL_FILE)))),
            secure: None,
        }
    }
}

/// The backend a router selected for one cell.
#[derive(Clone)]
pub enum BackendChoice {
    /// Persistence is a no-op on this host.
    Unavailable,
    /// The encrypted secure store.
    Secure(Arc<SecureStore>),
    /// The SQLite record store.
    Durable(Arc<SqliteStore>),
    /// The synchronous local file store.
    Local(Arc<LocalStore>),
}

impl BackendChoice {
    /// The selected backend as a trait object, if any.
    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        match self {
            BackendChoice::Unavailable => None,
            BackendChoice::Secure(store) => Some(store.clone()),
            BackendChoice::Durable(store) => Some(store.clone()),
            BackendChoice::Local(store) => Some(store.clone()),
        }
    }

    /// Whether the durable record store was selected.
    pub fn is_durable(&self) -> bool {
        matches!(self, BackendChoice::Durable(_))
    }
}

/// Routes one cell's persistence operations to the right backend.
pub struct PersistenceRouter {
    resolver: Arc<CapabilityResolver>,
    preference: BackendPreference,
}

impl PersistenceRouter {
    /// Create a router for a cell with the given backend preference.
    pub fn new(resolver: Arc<CapabilityResolver>, preference: BackendPreference) -> Self {
        Self {
            resolver,
            preference,
        }
    }

    /// Select the backend for this cell per the precedence rules.
    pub async fn select(&self) -> BackendChoice {
        let caps = self.resolver.resolve().await;
        match caps.platform {
            Platform::Unavailable => BackendChoice::Unavailable,
            Platform::Native => caps
                .secure
                .clone()
                .map(BackendChoice::Secure)
                .unwrap_or(BackendChoice::Unavailable),
            Platform::Hosted => {
                if self.preference == BackendPreference::Durable {
                    if let Some(durable) = caps.durable.clone() {
                        return BackendChoice::Durable(durable);
                    }
                }
                caps.local
                    .clone()
                    .map(BackendChoice::Local)
                    .unwrap_or(BackendChoice::Unavailable)
            }
        }
    }

    /// Read the record for a cell through the selected backend.
    pub async fn read(&self, name: &str) -> Option<StoredRecord> {
        let backend = self.select().await.backend()?;
        backend.read(name).await
    }

    /// Write the record for a cell through the selected backend.
    pub async fn write(&self, name: &str, record: StoredRecord) {
        if let Some(backend) = self.select().await.backend() {
            backend.write(name, record).await;
        }
    }

    /// One-time local-to-durable migration.
    ///
    /// When a durable-preferring cell initializes and finds nothing in the
    /// durable store, a record left in the local store by an earlier process
    /// version is copied over and then deleted from the local store. The
    /// record must pass the cell's admission check; the local copy is only
    /// deleted once the durable write succeeded.
    ///
    /// Returns the migrated record, which becomes the cell's stored pair.
    pub async fn migrate_legacy(
        &self,
        name: &str,
        admit: &(dyn Fn(&StoredRecord) -> bool + Sync),
    ) -> Option<StoredRecord> {
        let caps = self.resolver.resolve().await;
        let (Some(durable), Some(local)) = (caps.durable.as_ref(), caps.local.as_ref()) else {
            return None;
        };

        let record = local.read_sync(name)?;
        if !admit(&record) {
            debug!(%name, "legacy local record rejected, leaving in place");
            return None;
        }

        if let Err(err) = durable.try_write(name, record.clone()).await {
            warn!(%name, %err, "legacy migration write failed, keeping local record");
            return None;
        }
        local.delete_sync(name);
        info!(%name, "migrated legacy record from local store");
        Some(record)
    }
}
