//! Periodic poll coordination and the published value cache.
//!
//! One coordinator drives one gateway: it lazily rebuilds the read plan
//! when flagged, executes it through the gateway, decodes each entity's
//! payload slice and publishes the refreshed cache by whole-map swap.
//! Entities whose read or decode failed keep their previous value, so
//! consumers see stale-but-available data instead of gaps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::convert::decode;
use crate::entity::{EntityDescriptor, SlaveEntity};
use crate::gateway::{Gateway, ReadOutcome};
use crate::plan::{PlanError, ReadPlan, build_plan};
use crate::value::Value;

/// Default poll interval when the configuration does not set one.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-transaction read bound when the device profile does not
/// advertise one.
pub const DEFAULT_MAX_READ_SIZE: u16 = 8;

/// A decoded value together with the time it was last refreshed.
#[derive(Debug, Clone)]
pub struct CachedValue {
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// Plan inputs and the cached plan built from them.
struct PlanState {
    entities: Vec<SlaveEntity>,
    index: Arc<HashMap<String, EntityDescriptor>>,
    max_read_size: u16,
    plan: Option<Arc<ReadPlan>>,
    dirty: bool,
}

/// Drives poll cycles for one gateway and publishes decoded values.
pub struct PollCoordinator {
    gateway: Arc<Gateway>,
    refresh_interval: Duration,
    state: Mutex<PlanState>,
    cache: RwLock<Arc<HashMap<String, CachedValue>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_signal: tokio::sync::Notify,
}

impl PollCoordinator {
    pub fn new(gateway: Arc<Gateway>, refresh_interval: Duration) -> Self {
        Self {
            gateway,
            refresh_interval,
            state: Mutex::new(PlanState {
                entities: Vec::new(),
                index: Arc::new(HashMap::new()),
                max_read_size: DEFAULT_MAX_READ_SIZE,
                plan: None,
                dirty: true,
            }),
            cache: RwLock::new(Arc::new(HashMap::new())),
            task: Mutex::new(None),
            stop_signal: tokio::sync::Notify::new(),
        }
    }

    /// The gateway this coordinator polls through.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Replace the entity set wholesale. Takes effect on the next cycle
    /// through a plan rebuild.
    pub fn set_entities(&self, entities: Vec<SlaveEntity>) {
        let mut state = self.state.lock();
        state.entities = entities;
        state.dirty = true;
    }

    /// Update the device's advertised maximum read size.
    pub fn set_max_read_size(&self, max_read_size: u16) {
        let mut state = self.state.lock();
        if state.max_read_size != max_read_size {
            state.max_read_size = max_read_size;
            state.dirty = true;
        }
    }

    /// Flag the plan for recomputation on the next cycle.
    pub fn force_replan(&self) {
        self.state.lock().dirty = true;
    }

    /// Most recently decoded value for the entity, or `None` if it was
    /// never successfully decoded.
    pub fn get_data(&self, entity: &SlaveEntity) -> Option<Value> {
        self.cache
            .read()
            .get(&entity.desc.key)
            .map(|cached| cached.value.clone())
    }

    /// When the entity's value was last refreshed.
    pub fn last_refreshed(&self, entity: &SlaveEntity) -> Option<DateTime<Utc>> {
        self.cache
            .read()
            .get(&entity.desc.key)
            .map(|cached| cached.updated_at)
    }

    /// Run one poll cycle: lazy replan, plan execution, decode, publish.
    ///
    /// Returns an error only for plan-build contract violations; read and
    /// decode failures are isolated per operation/entity and never abort
    /// the cycle.
    pub async fn run_cycle(&self) -> Result<(), PlanError> {
        let (plan, index, max_read_size) = {
            let mut state = self.state.lock();
            if state.dirty || state.plan.is_none() {
                let plan = build_plan(&state.entities, state.max_read_size)?;
                debug!(
                    "Rebuilt read plan for {}: {} operations covering {} entities",
                    self.gateway.key(),
                    plan.operations.len(),
                    plan.entity_count()
                );
                state.index = Arc::new(
                    state
                        .entities
                        .iter()
                        .map(|entity| (entity.desc.key.clone(), entity.desc.clone()))
                        .collect(),
                );
                state.plan = Some(Arc::new(plan));
                state.dirty = false;
            }
            (
                state.plan.clone().unwrap_or_default(),
                state.index.clone(),
                state.max_read_size,
            )
        };

        let result = self.gateway.run_plan(&plan, max_read_size).await;

        let current: Arc<HashMap<String, CachedValue>> = self.cache.read().clone();
        let mut next: HashMap<String, CachedValue> = (*current).clone();
        let mut refreshed = 0usize;

        for (key, outcome) in &result.entries {
            let ReadOutcome::Success(payload) = outcome else {
                // Failed reads keep the previous value (stale-but-available).
                continue;
            };
            let Some(desc) = index.get(key) else {
                continue;
            };
            let previous = next.get(key).map(|cached| cached.value.clone());
            match decode(payload, desc, previous.as_ref()) {
                Ok(value) => {
                    next.insert(
                        key.clone(),
                        CachedValue {
                            value,
                            updated_at: Utc::now(),
                        },
                    );
                    refreshed += 1;
                }
                Err(e) => warn!("Failed to decode '{}': {}", key, e),
            }
        }

        *self.cache.write() = Arc::new(next);
        debug!(
            "Poll cycle for {}: refreshed {}/{} entities",
            self.gateway.key(),
            refreshed,
            result.entries.len()
        );
        Ok(())
    }

    /// Spawn the periodic poll task. The first cycle runs immediately;
    /// cycles never overlap because the next tick is scheduled only after
    /// the previous cycle finished.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if let Some(handle) = task.take() {
            handle.abort();
        }

        info!(
            "Starting poll loop for {} every {:?}",
            self.gateway.key(),
            self.refresh_interval
        );
        let coordinator = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = coordinator.run_cycle().await {
                    error!("Poll cycle for {} failed: {}", coordinator.gateway.key(), e);
                }
                tokio::select! {
                    _ = coordinator.stop_signal.notified() => break,
                    _ = tokio::time::sleep(coordinator.refresh_interval) => {}
                }
            }
        }));
    }

    /// Cancel the pending timer. Safe to call when never started. An
    /// in-flight cycle is not forcibly aborted: its transaction completes
    /// or fails on its own timeout, then the loop exits.
    pub fn stop(&self) {
        if self.task.lock().take().is_some() {
            self.stop_signal.notify_one();
            info!("Stopped poll loop for {}", self.gateway.key());
        }
    }
}

impl Drop for PollCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
