//! The buffer service: one explicit object owning the database, the record
//! source, the in-flight build map and the configuration.
//!
//! Construct it once with [`BufferService::open`] and share it (it is `Send +
//! Sync`; wrap it in an `Arc` to hand it to tasks). Nothing here is global,
//! so independent services over independent databases can coexist, which is
//! exactly what the tests do.
//!
//! # Build deduplication
//!
//! Every hash being built has a slot in the in-flight map: an async mutex
//! around the build's eventual outcome. Whoever holds the slot's lock and
//! finds no outcome yet performs the build, holding the lock until the
//! outcome is stored. Everyone else queues on the lock and replays the stored
//! outcome (success or failure) instead of building again. The map itself
//! is only locked for lookups and insertions, never across an `.await`.

use crate::Database;
use crate::active::{ActiveFilter, ActiveFilterStore, DEFAULT_SESSION};
use crate::criteria::{FilterCriteria, FilterHash};
use crate::error::{Error, ErrorKind, Result};
use crate::eviction::{self, EvictionPolicy};
use crate::health::SourceHealth;
use crate::page::{self, Page, PageOptions};
use crate::registry::{Registry, RegistryEntry};
use crate::source::SourceHandle;
use crate::store::{BufferStore, BuildOptions};
use glint_config::BufferConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    pub build: BuildOptions,
    pub page: PageOptions,
    pub eviction: EvictionPolicy,
    pub degraded_after_failures: u32,
}
impl From<&BufferConfig> for ServiceOptions {
    fn from(config: &BufferConfig) -> Self {
        Self {
            build: BuildOptions::from(config),
            page: PageOptions::from(config),
            eviction: EvictionPolicy::from(config),
            degraded_after_failures: config.degraded_after_failures,
        }
    }
}
impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from(&BufferConfig::default())
    }
}

/// Result of [`BufferService::refresh`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BufferSummary {
    pub hash: FilterHash,
    pub item_count: u64,
    /// `true` when an already Ready buffer answered the call; `false` when a
    /// build ran for it (whether this call's own or one it waited on).
    pub cached: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryStats {
    pub hash: FilterHash,
    pub row_count: u64,
    pub byte_size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: OffsetDateTime,
}
impl From<RegistryEntry> for EntryStats {
    fn from(entry: RegistryEntry) -> Self {
        Self {
            hash: entry.hash,
            row_count: entry.row_count,
            byte_size: entry.byte_size,
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub buffer_count: u64,
    pub total_size_bytes: u64,
    /// Hashes with a build in flight in this process.
    pub building: Vec<FilterHash>,
    pub degraded: bool,
    /// Most recently used first.
    pub entries: Vec<EntryStats>,
}

type Outcome = std::result::Result<BufferSummary, ErrorKind>;
type BuildSlot = Arc<tokio::sync::Mutex<Option<Outcome>>>;
type BuildMap = Mutex<HashMap<FilterHash, BuildSlot>>;

/// Removes a build's slot from the in-flight map when the build finishes,
/// fails, or its future is dropped.
struct BuildRegistration<'a> {
    builds: &'a BuildMap,
    hash: &'a FilterHash,
    slot: &'a BuildSlot,
}
impl Drop for BuildRegistration<'_> {
    fn drop(&mut self) {
        let mut builds = self.builds.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer build may have taken the hash over already; leave it be.
        if builds.get(self.hash).is_some_and(|current| Arc::ptr_eq(current, self.slot)) {
            builds.remove(self.hash);
        }
    }
}

pub struct BufferService {
    db: Database,
    registry: Registry,
    store: BufferStore,
    active: ActiveFilterStore,
    source: SourceHandle,
    health: SourceHealth,
    options: ServiceOptions,
    builds: BuildMap,
    build_count: AtomicU64,
}

impl BufferService {
    /// Create the service, dropping any buffer tables a previous process
    /// left behind mid-build.
    #[instrument(skip_all, fields(source = source.name()))]
    pub async fn open(db: Database, source: SourceHandle, options: ServiceOptions) -> Result<Self> {
        let registry = Registry::from(&db);
        let store = BufferStore::new(&db, registry.clone(), options.build);
        let active = ActiveFilterStore::new(&db, registry.clone());
        store.sweep_orphans().await?;
        let (count, bytes) = registry.totals().await?;
        info!(buffers = count, bytes, "buffer service ready");
        Ok(Self {
            db,
            registry,
            store,
            active,
            source,
            health: SourceHealth::new(options.degraded_after_failures),
            options,
            builds: Mutex::default(),
            build_count: AtomicU64::new(0),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Number of physical builds started by this service.
    pub fn build_count(&self) -> u64 {
        self.build_count.load(Ordering::SeqCst)
    }

    /// Whether the record source has failed often enough in a row that
    /// builds are being reported as [`ErrorKind::SourceUnavailable`].
    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    /// Make sure a Ready buffer exists for `criteria`, building it if needed.
    ///
    /// A Ready buffer is returned as is (and counts as an access for LRU
    /// purposes) without touching the record source. Concurrent calls for the
    /// same criteria share a single build.
    #[instrument(skip_all, fields(hash = %criteria.hash().short()))]
    pub async fn refresh(&self, criteria: &FilterCriteria) -> Result<BufferSummary> {
        criteria.validate()?;
        let hash = criteria.hash();
        if let Some(summary) = self.cached(&hash).await? {
            return Ok(summary);
        }
        self.build_once(criteria, hash, false).await
    }

    /// Build a fresh buffer for `criteria` even if one is Ready, replacing
    /// it once the new one is complete. The old buffer stays readable until
    /// then.
    #[instrument(skip_all, fields(hash = %criteria.hash().short()))]
    pub async fn rebuild(&self, criteria: &FilterCriteria) -> Result<BufferSummary> {
        criteria.validate()?;
        self.build_once(criteria, criteria.hash(), true).await
    }

    async fn cached(&self, hash: &FilterHash) -> Result<Option<BufferSummary>> {
        let Some(entry) = self.registry.get(hash).await? else {
            return Ok(None);
        };
        self.registry.touch(hash).await?;
        debug!(rows = entry.row_count, "buffer cache hit");
        Ok(Some(BufferSummary { hash: entry.hash, item_count: entry.row_count, cached: true }))
    }

    fn slot(&self, hash: &FilterHash) -> BuildSlot {
        let mut builds = self.builds.lock().unwrap_or_else(PoisonError::into_inner);
        builds.entry(hash.clone()).or_default().clone()
    }

    async fn build_once(&self, criteria: &FilterCriteria, hash: FilterHash, force: bool) -> Result<BufferSummary> {
        let slot = self.slot(&hash);
        let mut outcome = slot.lock().await;
        if let Some(outcome) = outcome.as_ref() {
            debug!("joined in-flight build");
            return outcome.clone().map_err(Error::from);
        }
        // From here on this call is the builder for the slot.
        let _registration = BuildRegistration { builds: &self.builds, hash: &hash, slot: &slot };
        // Someone may have published while we queued for the slot.
        if !force && let Some(summary) = self.cached(&hash).await? {
            *outcome = Some(Ok(summary.clone()));
            return Ok(summary);
        }
        self.build_count.fetch_add(1, Ordering::SeqCst);
        let result = self.store.build(self.source.as_ref(), criteria, &self.health).await;
        let summary = match result {
            Ok(entry) => BufferSummary { hash: entry.hash, item_count: entry.row_count, cached: false },
            Err(err) => {
                *outcome = Some(Err((*err).clone()));
                return Err(err);
            },
        };
        *outcome = Some(Ok(summary.clone()));
        drop(outcome);
        self.enforce_bounds(&hash).await;
        Ok(summary)
    }

    /// Evict down to the configured bounds, sparing `protect`. The build
    /// that triggered this already succeeded, so failures are only logged.
    async fn enforce_bounds(&self, protect: &FilterHash) {
        match eviction::enforce(&self.registry, &self.options.eviction, Some(protect)).await {
            Ok(evicted) if !evicted.is_empty() => debug!(count = evicted.len(), "eviction complete"),
            Ok(_) => {},
            Err(err) => warn!(error = ?err, "eviction failed; buffers may exceed configured bounds"),
        }
    }

    /// Read a page of the buffer for `hash`. `limit` is clamped to the
    /// configured page size range.
    ///
    /// Fails with [`ErrorKind::NotFound`] if the buffer doesn't exist (or was
    /// evicted while the caller was paginating) and with
    /// [`ErrorKind::CursorInvalid`] if the cursor doesn't belong to the
    /// current buffer.
    #[instrument(skip(self, cursor), fields(hash = %hash.short()))]
    pub async fn get_page(&self, hash: &FilterHash, cursor: Option<&str>, limit: Option<u32>) -> Result<Page> {
        let limit = self.options.page.limit(limit);
        let page = page::fetch_page(self.db.pool(), hash, cursor, limit).await?;
        // Touch after the read transaction has finished; evicted in between
        // just means there's nothing to touch.
        self.registry.touch(hash).await?;
        Ok(page)
    }

    pub async fn get_active_filter(&self) -> Result<Option<ActiveFilter>> {
        self.get_active_filter_for(DEFAULT_SESSION).await
    }

    pub async fn get_active_filter_for(&self, session: &str) -> Result<Option<ActiveFilter>> {
        self.active.get(session).await
    }

    /// Record `criteria` as the active filter. Does not build anything.
    pub async fn set_active_filter(&self, criteria: &FilterCriteria) -> Result<ActiveFilter> {
        self.set_active_filter_for(DEFAULT_SESSION, criteria).await
    }

    pub async fn set_active_filter_for(&self, session: &str, criteria: &FilterCriteria) -> Result<ActiveFilter> {
        criteria.validate()?;
        if session.is_empty() {
            exn::bail!(ErrorKind::InvalidCriteria("session must not be empty".to_string()));
        }
        self.active.set(session, criteria).await
    }

    pub async fn get_stats(&self) -> Result<BufferStats> {
        let entries = self.registry.list().await?;
        let mut building: Vec<_> = {
            let builds = self.builds.lock().unwrap_or_else(PoisonError::into_inner);
            builds.keys().cloned().collect()
        };
        building.sort();
        Ok(BufferStats {
            buffer_count: entries.len() as u64,
            total_size_bytes: entries.iter().map(|e| e.byte_size).sum(),
            building,
            degraded: self.is_degraded(),
            entries: entries.into_iter().map(EntryStats::from).collect(),
        })
    }

    /// Drop the buffer for `hash`. Returns `false` if there wasn't one.
    #[instrument(skip(self), fields(hash = %hash.short()))]
    pub async fn clear(&self, hash: &FilterHash) -> Result<bool> {
        let removed = self.registry.remove(hash).await?;
        if removed {
            info!("cleared buffer");
        }
        Ok(removed)
    }

    /// Drop every buffer. Returns how many were registered.
    ///
    /// Also sweeps orphaned tables. Builds in flight keep their staging
    /// tables and publish as usual once done.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<u64> {
        let removed = self.registry.remove_all().await?;
        self.store.sweep_orphans().await?;
        info!(count = removed, "cleared all buffers");
        Ok(removed)
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
