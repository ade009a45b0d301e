//! Dependency graph between federates
//!
//! An edge U -> N carries the delay tag of the connection from U's output to
//! N's input. The minimum-delay closure over all paths is computed lazily with
//! Floyd-Warshall relaxation, using tag delay addition as path composition,
//! and cached together with the cycle classification until the graph changes.

use std::cell::OnceCell;

use cadence_core::{FederateId, Tag};

/// All-pairs minimum delays plus cycle classification
#[derive(Debug, Clone)]
pub struct MinDelays {
    n: usize,
    /// Row-major: delays[from * n + to]
    delays: Vec<Tag>,
    in_cycle: Vec<bool>,
    in_zero_delay_cycle: Vec<bool>,
}

impl MinDelays {
    fn compute(upstream: &[Vec<(FederateId, Tag)>]) -> Self {
        let n = upstream.len();
        let mut delays = vec![Tag::FOREVER; n * n];

        for (to, edges) in upstream.iter().enumerate() {
            for &(from, delay) in edges {
                let cell = &mut delays[from.index() * n + to];
                *cell = (*cell).min(delay);
            }
        }

        // Diagonal is not reset to ZERO: a finite self-delay means a cycle
        for k in 0..n {
            for i in 0..n {
                let ik = delays[i * n + k];
                if ik.is_forever() {
                    continue;
                }
                for j in 0..n {
                    let kj = delays[k * n + j];
                    if kj.is_forever() {
                        continue;
                    }
                    let through_k = ik.delay(kj);
                    if through_k < delays[i * n + j] {
                        delays[i * n + j] = through_k;
                    }
                }
            }
        }

        let in_cycle = (0..n).map(|i| delays[i * n + i] < Tag::FOREVER).collect();
        let in_zero_delay_cycle = (0..n).map(|i| delays[i * n + i] == Tag::ZERO).collect();

        MinDelays {
            n,
            delays,
            in_cycle,
            in_zero_delay_cycle,
        }
    }

    /// Minimum delay over all paths from `from` to `to`, FOREVER if none
    #[inline]
    pub fn get(&self, from: FederateId, to: FederateId) -> Tag {
        self.delays[from.index() * self.n + to.index()]
    }

    #[inline]
    pub fn is_in_cycle(&self, id: FederateId) -> bool {
        self.in_cycle[id.index()]
    }

    #[inline]
    pub fn is_in_zero_delay_cycle(&self, id: FederateId) -> bool {
        self.in_zero_delay_cycle[id.index()]
    }

    /// Nodes with a path into `to`, paired with the minimum delay.
    /// Includes `to` itself when it lies on a cycle.
    pub fn upstream_closure(&self, to: FederateId) -> impl Iterator<Item = (FederateId, Tag)> + '_ {
        (0..self.n).filter_map(move |from| {
            let delay = self.delays[from * self.n + to.index()];
            (!delay.is_forever()).then(|| (FederateId::from(from), delay))
        })
    }
}

/// Immediate adjacency plus the cached closure
///
/// The declared topology is kept apart from the active one, so a federate
/// whose edges were removed on departure gets them back when it rejoins.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Connections as declared, including those of detached federates
    declared_upstream: Vec<Vec<(FederateId, Tag)>>,
    declared_downstream: Vec<Vec<FederateId>>,
    detached: Vec<bool>,
    /// upstream[n]: active federates feeding n, with connection delays
    upstream: Vec<Vec<(FederateId, Tag)>>,
    /// downstream[n]: active federates fed by n
    downstream: Vec<Vec<FederateId>>,
    min_delays: OnceCell<MinDelays>,
}

impl DependencyGraph {
    pub fn new(size: usize) -> Self {
        DependencyGraph {
            declared_upstream: vec![Vec::new(); size],
            declared_downstream: vec![Vec::new(); size],
            detached: vec![false; size],
            upstream: vec![Vec::new(); size],
            downstream: vec![Vec::new(); size],
            min_delays: OnceCell::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    pub fn contains(&self, id: FederateId) -> bool {
        id.index() < self.len()
    }

    /// Add a connection from `from` to `to`. Parallel connections keep the
    /// smaller delay.
    pub fn add_edge(&mut self, from: FederateId, to: FederateId, delay: Tag) {
        insert_edge(&mut self.declared_upstream, &mut self.declared_downstream, from, to, delay);
        if !self.detached[from.index()] && !self.detached[to.index()] {
            insert_edge(&mut self.upstream, &mut self.downstream, from, to, delay);
        }
        self.invalidate_min_delays();
    }

    /// Replace the neighbors of `id` with what the federate declared.
    pub fn set_neighbors(
        &mut self,
        id: FederateId,
        upstream: impl IntoIterator<Item = (FederateId, Tag)>,
        downstream: impl IntoIterator<Item = FederateId>,
    ) {
        let previous: Vec<FederateId> = self.declared_upstream[id.index()]
            .drain(..)
            .map(|(from, _)| from)
            .collect();
        for from in previous {
            self.declared_downstream[from.index()].retain(|to| *to != id);
        }
        for (from, delay) in upstream {
            if self.contains(from) {
                insert_edge(&mut self.declared_upstream, &mut self.declared_downstream, from, id, delay);
            }
        }
        for to in downstream {
            if self.contains(to) && !self.declared_downstream[id.index()].contains(&to) {
                self.declared_downstream[id.index()].push(to);
            }
        }
        self.rebuild();
    }

    /// Drop every edge touching `id` until [`Self::restore_node_edges`]
    pub fn remove_node_edges(&mut self, id: FederateId) {
        self.detached[id.index()] = true;
        self.rebuild();
    }

    /// Reinstate the declared edges of a federate removed earlier
    pub fn restore_node_edges(&mut self, id: FederateId) {
        if std::mem::replace(&mut self.detached[id.index()], false) {
            self.rebuild();
        }
    }

    pub fn is_detached(&self, id: FederateId) -> bool {
        self.detached[id.index()]
    }

    /// Active adjacency from the declared one, minus detached federates
    fn rebuild(&mut self) {
        let detached = &self.detached;
        for (n, edges) in self.declared_upstream.iter().enumerate() {
            self.upstream[n] = if detached[n] {
                Vec::new()
            } else {
                edges.iter().copied().filter(|(from, _)| !detached[from.index()]).collect()
            };
        }
        for (n, edges) in self.declared_downstream.iter().enumerate() {
            self.downstream[n] = if detached[n] {
                Vec::new()
            } else {
                edges.iter().copied().filter(|to| !detached[to.index()]).collect()
            };
        }
        self.invalidate_min_delays();
    }

    pub fn upstream(&self, id: FederateId) -> &[(FederateId, Tag)] {
        &self.upstream[id.index()]
    }

    pub fn downstream(&self, id: FederateId) -> &[FederateId] {
        &self.downstream[id.index()]
    }

    /// Cached closure, recomputed on first use after a change
    pub fn min_delays(&self) -> &MinDelays {
        self.min_delays
            .get_or_init(|| MinDelays::compute(&self.upstream))
    }

    /// Recompute the closure now
    pub fn update_min_delays(&mut self) -> &MinDelays {
        self.invalidate_min_delays();
        self.min_delays()
    }

    pub fn invalidate_min_delays(&mut self) {
        self.min_delays.take();
    }

    pub fn min_delay(&self, from: FederateId, to: FederateId) -> Tag {
        self.min_delays().get(from, to)
    }

    pub fn is_in_cycle(&self, id: FederateId) -> bool {
        self.min_delays().is_in_cycle(id)
    }

    pub fn is_in_zero_delay_cycle(&self, id: FederateId) -> bool {
        self.min_delays().is_in_zero_delay_cycle(id)
    }
}

fn insert_edge(
    upstream: &mut [Vec<(FederateId, Tag)>],
    downstream: &mut [Vec<FederateId>],
    from: FederateId,
    to: FederateId,
    delay: Tag,
) {
    let edges = &mut upstream[to.index()];
    match edges.iter_mut().find(|(id, _)| *id == from) {
        Some(edge) => edge.1 = edge.1.min(delay),
        None => edges.push((from, delay)),
    }
    let down = &mut downstream[from.index()];
    if !down.contains(&to) {
        down.push(to);
    }
}
