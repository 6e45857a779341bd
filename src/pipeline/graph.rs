//! Declarative pipeline graph.
//!
//! Stages are declared as `(kind, inputs, output)` tuples over named
//! connections. The builder validates the wiring, derives construction order
//! with a topological sort, picks each connection's producer mode and
//! instantiates the stages through a [`StageFactory`].

use super::connection::{Connection, ConnectionMode};
use super::error::{PipelineError, PipelineResult};
use super::executor::Pipeline;
use super::id::{ConnectionId, StageId};
use super::signal::ReemitSignal;
use super::stage_kind::StageKind;
use crate::backend::{StageHost, StageWiring};
use crate::config::StageTiming;
use crate::error::{Result, ResultExt};
use crate::heap::WeakHeap;
use crate::state::StateDb;
use std::collections::VecDeque;

/// Creates the host for one stage from its wiring.
pub trait StageFactory {
    fn create(&self, wiring: StageWiring) -> Result<StageHost>;
}

/// Shared resources every stage is wired to.
#[derive(Clone, Debug)]
pub struct PipelineRuntime {
    pub heap: WeakHeap,
    pub db: StateDb,
    pub timing: StageTiming,
}

#[derive(Debug, Clone)]
pub struct StageDecl {
    pub name: String,
    pub kind: StageKind,
    pub inputs: Vec<ConnectionId>,
    pub output: Option<ConnectionId>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    connections: Vec<String>,
    stages: Vec<StageDecl>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or look up) a connection by name.
    pub fn connection(&mut self, name: &str) -> ConnectionId {
        if let Some(idx) = self.connections.iter().position(|c| c == name) {
            return ConnectionId(idx as u32);
        }
        self.connections.push(name.to_string());
        ConnectionId((self.connections.len() - 1) as u32)
    }

    /// Add a stage named after its kind.
    pub fn add_stage(
        &mut self,
        kind: StageKind,
        inputs: &[ConnectionId],
        output: Option<ConnectionId>,
    ) -> StageId {
        let base = kind.key();
        let taken = self.stages.iter().filter(|s| s.kind == kind).count();
        let name = if taken == 0 {
            base.to_string()
        } else {
            format!("{}_{}", base, taken + 1)
        };
        self.add_named_stage(name, kind, inputs, output)
    }

    pub fn add_named_stage(
        &mut self,
        name: impl Into<String>,
        kind: StageKind,
        inputs: &[ConnectionId],
        output: Option<ConnectionId>,
    ) -> StageId {
        self.stages.push(StageDecl {
            name: name.into(),
            kind,
            inputs: inputs.to_vec(),
            output,
        });
        StageId((self.stages.len() - 1) as u32)
    }

    pub fn stages(&self) -> &[StageDecl] {
        &self.stages
    }

    pub fn connection_names(&self) -> &[String] {
        &self.connections
    }

    pub fn producers(&self, conn: ConnectionId) -> Vec<StageId> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.output == Some(conn))
            .map(|(i, _)| StageId(i as u32))
            .collect()
    }

    pub fn consumers(&self, conn: ConnectionId) -> Vec<StageId> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.inputs.contains(&conn))
            .map(|(i, _)| StageId(i as u32))
            .collect()
    }

    /// Multi-producer when more than one stage writes the connection.
    pub fn connection_mode(&self, conn: ConnectionId) -> ConnectionMode {
        if self.producers(conn).len() > 1 {
            ConnectionMode::MultiProducer
        } else {
            ConnectionMode::SingleProducer
        }
    }

    /// Producer sets of multi-producer connections; at most one member should run.
    pub fn exclusive_groups(&self) -> Vec<Vec<StageId>> {
        (0..self.connections.len())
            .map(|i| self.producers(ConnectionId(i as u32)))
            .filter(|p| p.len() > 1)
            .collect()
    }

    fn validate(&self) -> PipelineResult<()> {
        let n_conn = self.connections.len();
        for stage in &self.stages {
            for conn in stage.inputs.iter().chain(stage.output.iter()) {
                if conn.index() >= n_conn {
                    return Err(PipelineError::UnknownConnection(*conn));
                }
            }
        }
        for stage in &self.stages {
            for conn in &stage.inputs {
                if self.producers(*conn).is_empty() {
                    return Err(PipelineError::InvalidEdge(format!(
                        "connection '{}' consumed by '{}' has no producer",
                        self.connections[conn.index()],
                        stage.name
                    )));
                }
            }
        }
        let mut names: Vec<_> = self.stages.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(PipelineError::InvalidEdge(format!(
                "stage name '{}' used twice",
                w[0]
            )));
        }
        Ok(())
    }

    /// Producers before consumers; ties keep declaration order.
    pub fn construction_order(&self) -> PipelineResult<Vec<StageId>> {
        self.validate()?;

        let n = self.stages.len();
        let mut in_degree = vec![0u32; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (to, stage) in self.stages.iter().enumerate() {
            for conn in &stage.inputs {
                for from in self.producers(*conn) {
                    adj[from.index()].push(to);
                    in_degree[to] += 1;
                }
            }
        }

        // Kahn's algorithm
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(stage) = queue.pop_front() {
            order.push(StageId(stage as u32));
            for &next in &adj[stage] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            tracing::warn!(
                "Pipeline graph has a cycle! Only {} of {} stages ordered.",
                order.len(),
                n
            );
            return Err(PipelineError::CycleDetected);
        }
        Ok(order)
    }

    /// Instantiate connections and stages.
    pub fn build(&self, factory: &dyn StageFactory, runtime: PipelineRuntime) -> Result<Pipeline> {
        let order = self.construction_order()?;
        let reemit = ReemitSignal::new();

        let connections: Vec<Connection> = self
            .connections
            .iter()
            .enumerate()
            .map(|(i, name)| Connection::new(name.clone(), self.connection_mode(ConnectionId(i as u32))))
            .collect();

        // Hosts are indexed by StageId, constructed in topological order.
        let mut slots: Vec<Option<StageHost>> = (0..self.stages.len()).map(|_| None).collect();
        for id in &order {
            let decl = &self.stages[id.index()];
            let wiring = StageWiring {
                id: *id,
                name: decl.name.clone(),
                kind: decl.kind,
                heap: runtime.heap.clone(),
                reemit: reemit.clone(),
                inputs: decl.inputs.iter().map(|c| connections[c.index()].clone()).collect(),
                output: decl.output.map(|c| connections[c.index()].clone()),
                db: runtime.db.clone(),
                timing: runtime.timing,
            };
            tracing::debug!("Constructing stage '{}' ({})", decl.name, decl.kind);
            let host = factory
                .create(wiring)
                .with_context(|| format!("Failed to construct stage '{}'", decl.name))?;
            slots[id.index()] = Some(host);
        }
        let hosts = slots.into_iter().flatten().collect();

        Ok(Pipeline::new(
            hosts,
            order,
            connections,
            self.exclusive_groups(),
            runtime,
            reemit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[StageId], id: StageId) -> usize {
        order.iter().position(|&x| x == id).unwrap()
    }

    #[test]
    fn test_construction_order_follows_edges() {
        let mut g = PipelineGraph::new();
        let a = g.connection("a");
        let b = g.connection("b");
        // Declared out of order on purpose.
        let merger = g.add_stage(StageKind::FaceMerger, &[b], None);
        let detector = g.add_stage(StageKind::FaceDetector, &[a], Some(b));
        let source = g.add_stage(StageKind::FileSource, &[], Some(a));

        let order = g.construction_order().unwrap();
        assert!(position(&order, source) < position(&order, detector));
        assert!(position(&order, detector) < position(&order, merger));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = PipelineGraph::new();
        let a = g.connection("a");
        let b = g.connection("b");
        g.add_stage(StageKind::FaceDetector, &[a], Some(b));
        g.add_stage(StageKind::FaceMarker, &[b], Some(a));
        assert!(matches!(
            g.construction_order(),
            Err(PipelineError::CycleDetected)
        ));
    }

    #[test]
    fn test_unproduced_and_unknown_connections() {
        let mut g = PipelineGraph::new();
        let a = g.connection("a");
        g.add_stage(StageKind::FaceDetector, &[a], None);
        assert!(matches!(
            g.construction_order(),
            Err(PipelineError::InvalidEdge(_))
        ));

        let mut g = PipelineGraph::new();
        g.add_stage(StageKind::FaceDetector, &[ConnectionId(9)], None);
        assert!(matches!(
            g.construction_order(),
            Err(PipelineError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_multi_producer_groups() {
        let mut g = PipelineGraph::new();
        let src = g.connection("sources");
        let out = g.connection("out");
        let cam = g.add_stage(StageKind::CameraSource, &[], Some(src));
        let file = g.add_stage(StageKind::FileSource, &[], Some(src));
        g.add_stage(StageKind::FaceDetector, &[src], Some(out));

        assert_eq!(g.connection_mode(src), ConnectionMode::MultiProducer);
        assert_eq!(g.connection_mode(out), ConnectionMode::SingleProducer);
        assert_eq!(g.exclusive_groups(), vec![vec![cam, file]]);
    }

    #[test]
    fn test_duplicate_kind_gets_suffix() {
        let mut g = PipelineGraph::new();
        let a = g.connection("a");
        g.add_stage(StageKind::FileSource, &[], Some(a));
        let second = g.add_stage(StageKind::FileSource, &[], Some(a));
        assert_eq!(g.stages()[second.index()].name, "file_source_2");
        assert_eq!(g.connection("a"), a);
    }
}
