//! Built pipeline: stage hosts, connections and orchestration.

use super::connection::Connection;
use super::error::{PipelineError, PipelineResult};
use super::graph::PipelineRuntime;
use super::id::StageId;
use super::scheduler::Scheduler;
use super::signal::ReemitSignal;
use super::stage_kind::StageKind;
use crate::backend::{LifecycleError, StageHost};
use crate::heap::WeakHeap;
use crate::state::StateDb;
use std::time::{Duration, Instant};

/// All stages of one graph plus the resources they share.
pub struct Pipeline {
    hosts: Vec<StageHost>,
    order: Vec<StageId>,
    connections: Vec<Connection>,
    exclusive_groups: Vec<Vec<StageId>>,
    heap: WeakHeap,
    db: StateDb,
    reemit: ReemitSignal,
}

impl Pipeline {
    pub(crate) fn new(
        hosts: Vec<StageHost>,
        order: Vec<StageId>,
        connections: Vec<Connection>,
        exclusive_groups: Vec<Vec<StageId>>,
        runtime: PipelineRuntime,
        reemit: ReemitSignal,
    ) -> Self {
        tracing::info!(
            "Pipeline built: {} stages, {} connections",
            hosts.len(),
            connections.len()
        );
        Self {
            hosts,
            order,
            connections,
            exclusive_groups,
            heap: runtime.heap,
            db: runtime.db,
            reemit,
        }
    }

    pub fn stages(&self) -> &[StageHost] {
        &self.hosts
    }

    pub fn construction_order(&self) -> &[StageId] {
        &self.order
    }

    pub fn stage(&self, id: StageId) -> Option<&StageHost> {
        self.hosts.get(id.index())
    }

    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut StageHost> {
        self.hosts.get_mut(id.index())
    }

    /// First stage of `kind`.
    pub fn stage_by_kind(&self, kind: StageKind) -> Option<&StageHost> {
        self.hosts.iter().find(|h| h.kind() == kind)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&StageHost> {
        self.hosts.iter().find(|h| h.name() == name)
    }

    pub fn stage_id(&self, name: &str) -> PipelineResult<StageId> {
        self.stage_by_name(name)
            .map(StageHost::id)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name() == name)
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn heap(&self) -> &WeakHeap {
        &self.heap
    }

    pub fn state_db(&self) -> &StateDb {
        &self.db
    }

    pub fn reemit_signal(&self) -> &ReemitSignal {
        &self.reemit
    }

    /// Stages sharing a multi-producer output with `id`.
    pub fn exclusive_siblings(&self, id: StageId) -> Vec<StageId> {
        self.exclusive_groups
            .iter()
            .filter(|g| g.contains(&id))
            .flat_map(|g| g.iter().copied().filter(|&s| s != id))
            .collect()
    }

    fn host_mut(&mut self, id: StageId) -> PipelineResult<&mut StageHost> {
        self.hosts
            .get_mut(id.index())
            .ok_or_else(|| PipelineError::UnknownStage(format!("{:?}", id)))
    }

    /// Start a stage, stopping any exclusive siblings first.
    pub fn start_stage(&mut self, id: StageId) -> crate::error::Result<()> {
        for sibling in self.exclusive_siblings(id) {
            self.host_mut(sibling)?.stop()?;
        }
        self.host_mut(id)?.start()?;
        Ok(())
    }

    pub fn stop_stage(&mut self, id: StageId) -> crate::error::Result<()> {
        self.host_mut(id)?.stop()?;
        Ok(())
    }

    /// Switch stages on according to persisted flags and kind defaults.
    ///
    /// Within an exclusive group only the first stage that wants to be on is
    /// started.
    pub fn restore_on_off_states(&mut self) -> Result<(), LifecycleError> {
        for id in self.order.clone() {
            let sibling_on = self.exclusive_siblings(id).into_iter().any(|s| {
                self.hosts
                    .get(s.index())
                    .is_some_and(|h| h.is_started() || h.is_starting())
            });
            let host = &mut self.hosts[id.index()];
            if sibling_on {
                tracing::debug!(
                    "Leaving '{}' off: an exclusive sibling is already on",
                    host.name()
                );
                continue;
            }
            let default = host.kind().default_enabled();
            host.restore_on_off_state(default)?;
        }
        Ok(())
    }

    /// Pump every host, then the state database.
    pub fn process_messages(&mut self) {
        for host in &mut self.hosts {
            host.process_messages();
        }
        self.db.process_messages();
    }

    pub fn all_stopped(&self) -> bool {
        self.hosts.iter().all(StageHost::is_stopped)
    }

    pub fn any_transitioning(&self) -> bool {
        self.hosts
            .iter()
            .any(|h| h.is_starting() || h.is_stopping())
    }

    /// Graceful two-phase shutdown.
    ///
    /// 1. For each stage: pump until it is neither starting nor stopping,
    ///    persist its on/off flag, request stop.
    /// 2. Pump until every stage is stopped.
    /// 3. Flush the state database.
    pub fn shutdown(&mut self, scheduler: &mut Scheduler, timeout: Duration) -> PipelineResult<()> {
        tracing::info!("Shutting down pipeline");
        let deadline = Instant::now() + timeout;
        let remaining = |deadline: Instant| deadline.saturating_duration_since(Instant::now());

        for idx in 0..self.hosts.len() {
            scheduler.run_until(
                &mut *self,
                |p| {
                    let h = &p.hosts[idx];
                    !(h.is_starting() || h.is_stopping())
                },
                remaining(deadline),
            );
            let host = &mut self.hosts[idx];
            host.save_on_off_state();
            if let Err(e) = host.stop() {
                tracing::warn!("Failed to stop '{}': {}", host.name(), e);
            }
        }

        let stopped = scheduler.run_until(&mut *self, Pipeline::all_stopped, remaining(deadline));
        self.db.finish_pending_jobs();

        if stopped {
            tracing::info!("Pipeline stopped");
            Ok(())
        } else {
            let stuck: Vec<_> = self
                .hosts
                .iter()
                .filter(|h| !h.is_stopped())
                .map(|h| h.name().to_string())
                .collect();
            tracing::warn!("Shutdown timed out, still running: {:?}", stuck);
            Err(PipelineError::ShutdownTimeout(timeout))
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.hosts)
            .field("connections", &self.connections)
            .finish()
    }
}
