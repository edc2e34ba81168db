//! Priority-ordered pools of substitutable resources
//!
//! A pool holds the redundant resources one dependency can be called with:
//! API credentials gathered from several sources, or a ranked list of
//! substitute targets (alternate search results). Entries are offered in
//! ascending `priority_rank`; a failed entry is disabled and never offered
//! again during the run unless its disable was time-boxed and has elapsed.

use crate::error_recovery::classifier::{ClassifiedError, ErrorKind};
use crate::error_recovery::DependencyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One substitutable resource
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Lower ranks are tried first; unique within a pool
    pub priority_rank: u32,
    /// Source the value was loaded from ("explicit", "env:MODEL_API_KEY", ...)
    pub source_label: String,
    /// Serialized masked, like `Debug`
    #[serde(serialize_with = "serialize_masked")]
    pub value: String,
    pub disabled: bool,
    pub disabled_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ResourceEntry {
    pub fn new<L: Into<String>, V: Into<String>>(priority_rank: u32, source_label: L, value: V) -> Self {
        Self {
            priority_rank,
            source_label: source_label.into(),
            value: value.into(),
            disabled: false,
            disabled_until: None,
            last_used: None,
        }
    }

    /// Value shortened for logs: first four characters only
    pub fn masked_value(&self) -> String {
        mask(&self.value)
    }
}

fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{prefix}***")
}

fn serialize_masked<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&mask(value))
}

impl fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("priority_rank", &self.priority_rank)
            .field("source_label", &self.source_label)
            .field("value", &self.masked_value())
            .field("disabled", &self.disabled)
            .field("disabled_until", &self.disabled_until)
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// How long a disabled entry stays out of rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Disabled until the process restarts
    #[default]
    ProcessLifetime,
    /// Disabled for a fixed period, then offered again
    TimeBoxed(#[serde(with = "humantime_serde")] Duration),
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub dependency: DependencyId,
    pub total: usize,
    pub available: usize,
    pub disabled: usize,
    pub rotations: u64,
    pub current_rank: Option<u32>,
}

struct PoolSlot {
    entry: ResourceEntry,
    reenable_at: Option<Instant>,
}

impl PoolSlot {
    /// Whether the slot can be offered now, re-enabling an elapsed time-box
    fn refresh(&mut self, now: Instant) -> bool {
        if self.entry.disabled {
            if let Some(at) = self.reenable_at {
                if now >= at {
                    self.entry.disabled = false;
                    self.entry.disabled_until = None;
                    self.reenable_at = None;
                    info!(
                        rank = self.entry.priority_rank,
                        source = %self.entry.source_label,
                        "Resource re-enabled after time-boxed disable"
                    );
                }
            }
        }
        !self.entry.disabled
    }
}

/// Ordered resources for one dependency
pub struct ResourcePool {
    dependency: DependencyId,
    slots: Vec<PoolSlot>,
    cursor: Option<usize>,
    policy: ExhaustionPolicy,
    rotations: u64,
}

impl ResourcePool {
    /// Create a pool; entries are ordered by rank once and never re-ordered
    pub fn new(dependency: DependencyId, mut entries: Vec<ResourceEntry>) -> Self {
        entries.sort_by_key(|e| e.priority_rank);
        Self {
            dependency,
            slots: entries
                .into_iter()
                .map(|entry| PoolSlot {
                    entry,
                    reenable_at: None,
                })
                .collect(),
            cursor: None,
            policy: ExhaustionPolicy::default(),
            rotations: 0,
        }
    }

    /// Pool of ranked candidates from a single source, ranked by position
    pub fn ranked<L, I, V>(dependency: DependencyId, source_label: L, values: I) -> Self
    where
        L: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let label = source_label.into();
        let entries = values
            .into_iter()
            .enumerate()
            .map(|(rank, value)| ResourceEntry::new(rank as u32, label.clone(), value))
            .collect();
        Self::new(dependency, entries)
    }

    pub fn with_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dependency(&self) -> &DependencyId {
        &self.dependency
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Entry most recently handed out, if still usable
    pub fn current(&self) -> Option<&ResourceEntry> {
        self.cursor
            .map(|i| &self.slots[i].entry)
            .filter(|e| !e.disabled)
    }

    /// Move the cursor to the highest-priority usable entry and return it.
    ///
    /// Fails with a `RESOURCE_EXHAUSTED` error once every entry is disabled.
    pub fn rotate(&mut self) -> std::result::Result<ResourceEntry, ClassifiedError> {
        self.rotations += 1;
        let now = Instant::now();

        let next = self.slots.iter_mut().position(|slot| slot.refresh(now));
        match next {
            Some(index) => {
                self.cursor = Some(index);
                let slot = &mut self.slots[index];
                slot.entry.last_used = Some(Utc::now());
                debug!(
                    dependency = %self.dependency,
                    rank = slot.entry.priority_rank,
                    source = %slot.entry.source_label,
                    "Rotated to resource"
                );
                Ok(slot.entry.clone())
            }
            None => {
                self.cursor = None;
                warn!(
                    dependency = %self.dependency,
                    entries = self.slots.len(),
                    "Resource pool exhausted"
                );
                Err(ClassifiedError::new(
                    ErrorKind::ResourceExhausted,
                    format!(
                        "all {} resources for {} are disabled",
                        self.slots.len(),
                        self.dependency
                    ),
                )
                .with_detail("dependency", self.dependency.as_str())
                .with_detail("pool_size", self.slots.len() as u64))
            }
        }
    }

    /// Disable an entry by rank.
    ///
    /// `disabled_for` time-boxes the disable; without it the pool's
    /// [`ExhaustionPolicy`] decides. Returns false for an unknown rank.
    pub fn mark_disabled(&mut self, priority_rank: u32, disabled_for: Option<Duration>) -> bool {
        let policy_box = match self.policy {
            ExhaustionPolicy::ProcessLifetime => None,
            ExhaustionPolicy::TimeBoxed(period) => Some(period),
        };
        let disabled_for = disabled_for.or(policy_box);

        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.entry.priority_rank == priority_rank)
        else {
            return false;
        };

        slot.entry.disabled = true;
        match disabled_for {
            Some(period) => {
                // Periods past the clock's range behave like a process-lifetime disable
                slot.reenable_at = Instant::now().checked_add(period);
                slot.entry.disabled_until = chrono::Duration::from_std(period)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
            }
            None => {
                slot.reenable_at = None;
                slot.entry.disabled_until = None;
            }
        }

        warn!(
            dependency = %self.dependency,
            rank = priority_rank,
            source = %slot.entry.source_label,
            until = ?slot.entry.disabled_until,
            "Resource disabled"
        );
        true
    }

    /// Copy of every entry in priority order
    pub fn entries(&self) -> Vec<ResourceEntry> {
        self.slots.iter().map(|s| s.entry.clone()).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let disabled = self.slots.iter().filter(|s| s.entry.disabled).count();
        PoolStats {
            dependency: self.dependency.clone(),
            total: self.slots.len(),
            available: self.slots.len() - disabled,
            disabled,
            rotations: self.rotations,
            current_rank: self.current().map(|e| e.priority_rank),
        }
    }
}

/// Pools keyed by dependency, each behind its own lock
#[derive(Default)]
pub struct ResourcePoolRegistry {
    pools: RwLock<HashMap<DependencyId, Arc<Mutex<ResourcePool>>>>,
}

impl ResourcePoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool, replacing any earlier pool for the same dependency
    pub async fn register(&self, pool: ResourcePool) {
        let dependency = pool.dependency().clone();
        info!(%dependency, entries = pool.len(), "Registered resource pool");
        self.pools
            .write()
            .await
            .insert(dependency, Arc::new(Mutex::new(pool)));
    }

    pub async fn has_pool(&self, dependency: &DependencyId) -> bool {
        self.pools.read().await.contains_key(dependency)
    }

    async fn pool(&self, dependency: &DependencyId) -> Option<Arc<Mutex<ResourcePool>>> {
        self.pools.read().await.get(dependency).cloned()
    }

    /// Rotate the dependency's pool
    pub async fn rotate(
        &self,
        dependency: &DependencyId,
    ) -> std::result::Result<ResourceEntry, ClassifiedError> {
        match self.pool(dependency).await {
            Some(pool) => pool.lock().await.rotate(),
            None => Err(ClassifiedError::new(
                ErrorKind::ResourceExhausted,
                format!("no resource pool registered for {dependency}"),
            )
            .with_detail("dependency", dependency.as_str())),
        }
    }

    /// Disable an entry in the dependency's pool
    pub async fn mark_disabled(
        &self,
        dependency: &DependencyId,
        priority_rank: u32,
        disabled_for: Option<Duration>,
    ) -> bool {
        match self.pool(dependency).await {
            Some(pool) => pool.lock().await.mark_disabled(priority_rank, disabled_for),
            None => false,
        }
    }

    pub async fn stats(&self, dependency: &DependencyId) -> Option<PoolStats> {
        match self.pool(dependency).await {
            Some(pool) => Some(pool.lock().await.stats()),
            None => None,
        }
    }

    pub async fn entries(&self, dependency: &DependencyId) -> Option<Vec<ResourceEntry>> {
        match self.pool(dependency).await {
            Some(pool) => Some(pool.lock().await.entries()),
            None => None,
        }
    }
}
