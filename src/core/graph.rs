//! Task graph structure and completion tracking.
//!
//! Every task except a root has exactly one owner and is attached to it as a
//! child or a follow-on. Children start once the owner's body completes;
//! follow-ons start once the owner and all of its children's subtrees are
//! finished.
//!
//! A task can be *encapsulated*. From then on, children and follow-ons that
//! anyone other than the task's own body attaches to it are external: they
//! wait for the whole group (the task, its children and its follow-ons,
//! recursively, including everything spawned at runtime). Readers of an
//! encapsulated task's promise wait for the group too.
//!
//! Completion is tracked with per-task counters of unfinished attachments
//! rather than by walking the graph. A task passes through milestones in
//! order; each milestone releases the tasks waiting on it:
//!
//! ```text
//! Completed        own body returned                -> internal children
//! ChildrenDone     + internal children finished     -> internal follow-ons
//! GroupDone        + internal follow-ons finished   -> external children
//! ExtChildrenDone  + external children finished     -> external follow-ons
//! Finished         + external follow-ons finished   -> notifies the owner
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use thiserror::Error;

use super::promise::PromiseCell;
use super::task::{TaskRef, TaskSpec};
use crate::domain::{TaskId, TaskState};

/// Structural errors in a task graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("task {0} is not part of this graph")]
    UnknownTask(TaskId),

    #[error("task {task} depends on {dependency}, which is not completed, not the spawning task and not spawned alongside it")]
    BackEdge { task: TaskId, dependency: TaskId },

    #[error("dependency cycle through task {0}")]
    Cycle(TaskId),
}

/// How a task hangs off its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Child,
    FollowOn,
}

/// Relation plus whether it crosses an encapsulation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    Child,
    FollowOn,
    ExternalChild,
    ExternalFollowOn,
}

impl Attachment {
    fn new(relation: Relation, external: bool) -> Self {
        match (relation, external) {
            (Relation::Child, false) => Attachment::Child,
            (Relation::FollowOn, false) => Attachment::FollowOn,
            (Relation::Child, true) => Attachment::ExternalChild,
            (Relation::FollowOn, true) => Attachment::ExternalFollowOn,
        }
    }

    /// Owner milestone that lets the attached task start
    pub fn released_at(self) -> Milestone {
        match self {
            Attachment::Child => Milestone::Completed,
            Attachment::FollowOn => Milestone::ChildrenDone,
            Attachment::ExternalChild => Milestone::GroupDone,
            Attachment::ExternalFollowOn => Milestone::ExtChildrenDone,
        }
    }

    /// Owner milestone that waits for the attached task to finish
    pub fn awaited_by(self) -> Milestone {
        match self {
            Attachment::Child => Milestone::ChildrenDone,
            Attachment::FollowOn => Milestone::GroupDone,
            Attachment::ExternalChild => Milestone::ExtChildrenDone,
            Attachment::ExternalFollowOn => Milestone::Finished,
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Completion stages of a task, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Milestone {
    Completed,
    ChildrenDone,
    GroupDone,
    ExtChildrenDone,
    Finished,
}

/// Milestone a promise reader waits for
fn promise_milestone(producer_sealed: bool) -> Milestone {
    if producer_sealed {
        Milestone::GroupDone
    } else {
        Milestone::Completed
    }
}

/// Shared task id counter, so spawned tasks never collide with static ones
#[derive(Debug, Clone, Default)]
pub(crate) struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    pub(crate) fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

pub(crate) struct NodeDecl {
    pub(crate) spec: TaskSpec,
    pub(crate) cell: PromiseCell,
    pub(crate) owner: Option<(TaskId, Attachment)>,
    pub(crate) sealed: bool,
}

/// A set of tasks under construction.
///
/// Used both for the static graph handed to the engine and for the batch of
/// tasks a running body spawns. In a spawn batch the spawning task is the
/// *anchor*: new tasks may hang off it, and edges it adds to itself are
/// always internal.
pub struct TaskGraph {
    ids: IdAllocator,
    anchor: Option<TaskId>,
    nodes: BTreeMap<TaskId, NodeDecl>,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    /// Create an empty static graph
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::default(),
            anchor: None,
            nodes: BTreeMap::new(),
        }
    }

    pub(crate) fn spawn_batch(ids: IdAllocator, anchor: TaskId) -> Self {
        Self {
            ids,
            anchor: Some(anchor),
            nodes: BTreeMap::new(),
        }
    }

    pub(crate) fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Add a task with no owner
    pub fn add_root(&mut self, spec: TaskSpec) -> TaskRef {
        self.insert(spec, None)
    }

    /// Add a task that starts after `parent` completes
    pub fn add_child(&mut self, parent: &TaskRef, spec: TaskSpec) -> Result<TaskRef, GraphError> {
        self.attach(parent.id(), Relation::Child, spec)
    }

    /// Add a task that starts after `parent` and its children's subtrees finish
    pub fn add_follow_on(&mut self, parent: &TaskRef, spec: TaskSpec) -> Result<TaskRef, GraphError> {
        self.attach(parent.id(), Relation::FollowOn, spec)
    }

    /// Seal `task` so that edges other tasks add to it wait for its whole group
    pub fn encapsulate(&mut self, task: &TaskRef) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(&task.id())
            .ok_or(GraphError::UnknownTask(task.id()))?;
        node.sealed = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check the graph for cycles (promise reads included)
    pub fn validate(&self) -> Result<(), GraphError> {
        let shapes = self
            .nodes
            .iter()
            .map(|(&id, decl)| Ok((id, decl.owner, self.deps_of(id, decl, &LiveGraph::default(), None)?)))
            .collect::<Result<Vec<_>, GraphError>>()?;
        check_acyclic(shapes.iter().map(|(id, owner, deps)| (*id, *owner, deps.as_slice())))
    }

    /// Attach to `owner` from the owner's own body; never external
    pub(crate) fn attach_internal(&mut self, owner: TaskId, relation: Relation, spec: TaskSpec) -> TaskRef {
        self.insert(spec, Some((owner, Attachment::new(relation, false))))
    }

    fn attach(&mut self, parent: TaskId, relation: Relation, spec: TaskSpec) -> Result<TaskRef, GraphError> {
        let external = if Some(parent) == self.anchor {
            false
        } else {
            self.nodes
                .get(&parent)
                .ok_or(GraphError::UnknownTask(parent))?
                .sealed
        };
        Ok(self.insert(spec, Some((parent, Attachment::new(relation, external)))))
    }

    fn insert(&mut self, spec: TaskSpec, owner: Option<(TaskId, Attachment)>) -> TaskRef {
        let id = self.ids.next();
        let cell = PromiseCell::new(id);
        let task_ref = TaskRef::new(id, cell.promise());
        self.nodes.insert(
            id,
            NodeDecl {
                spec,
                cell,
                owner,
                sealed: false,
            },
        );
        task_ref
    }

    /// Dependencies of a declared task: its owner's release plus promise reads
    fn deps_of(
        &self,
        id: TaskId,
        decl: &NodeDecl,
        live: &LiveGraph,
        spawner: Option<TaskId>,
    ) -> Result<Vec<(TaskId, Milestone)>, GraphError> {
        let mut deps = Vec::new();
        if let Some((owner, attachment)) = decl.owner {
            deps.push((owner, attachment.released_at()));
        }

        for producer in decl.spec.promise_producers() {
            let sealed = if let Some(other) = self.nodes.get(&producer) {
                other.sealed
            } else if let Some(node) = live.nodes.get(&producer) {
                if Some(producer) != spawner && node.state != TaskState::Completed {
                    return Err(GraphError::BackEdge {
                        task: id,
                        dependency: producer,
                    });
                }
                node.sealed
            } else {
                return Err(GraphError::UnknownTask(producer));
            };
            let dep = (producer, promise_milestone(sealed));
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        Ok(deps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Vertex {
    Start(TaskId),
    At(TaskId, Milestone),
}

const MILESTONES: [Milestone; 5] = [
    Milestone::Completed,
    Milestone::ChildrenDone,
    Milestone::GroupDone,
    Milestone::ExtChildrenDone,
    Milestone::Finished,
];

/// Reject task sets whose milestones depend on each other in a loop
fn check_acyclic<'a, I>(shapes: I) -> Result<(), GraphError>
where
    I: IntoIterator<Item = (TaskId, Option<(TaskId, Attachment)>, &'a [(TaskId, Milestone)])>,
{
    let mut graph: DiGraphMap<Vertex, ()> = DiGraphMap::new();

    for (id, owner, deps) in shapes {
        graph.add_edge(Vertex::Start(id), Vertex::At(id, Milestone::Completed), ());
        for pair in MILESTONES.windows(2) {
            graph.add_edge(Vertex::At(id, pair[0]), Vertex::At(id, pair[1]), ());
        }
        if let Some((parent, attachment)) = owner {
            graph.add_edge(
                Vertex::At(id, Milestone::Finished),
                Vertex::At(parent, attachment.awaited_by()),
                (),
            );
        }
        for &(producer, milestone) in deps {
            graph.add_edge(Vertex::At(producer, milestone), Vertex::Start(id), ());
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        let id = match cycle.node_id() {
            Vertex::Start(id) | Vertex::At(id, _) => id,
        };
        GraphError::Cycle(id)
    })
}

/// A task inside a running engine
pub(crate) struct LiveNode {
    pub(crate) spec: Option<TaskSpec>,
    pub(crate) name: String,
    pub(crate) unit: Option<String>,
    pub(crate) cores: u32,
    pub(crate) cell: PromiseCell,
    pub(crate) owner: Option<(TaskId, Attachment)>,
    pub(crate) sealed: bool,
    pub(crate) deps: Vec<(TaskId, Milestone)>,
    pub(crate) state: TaskState,
    pending_deps: usize,
    reached: Option<Milestone>,
    outstanding: [usize; 4],
}

impl LiveNode {
    fn next_milestone(&self) -> Option<Milestone> {
        let clear = |attachment: Attachment| self.outstanding[attachment.slot()] == 0;
        match self.reached {
            None if self.state == TaskState::Completed => Some(Milestone::Completed),
            Some(Milestone::Completed) if clear(Attachment::Child) => Some(Milestone::ChildrenDone),
            Some(Milestone::ChildrenDone) if clear(Attachment::FollowOn) => Some(Milestone::GroupDone),
            Some(Milestone::GroupDone) if clear(Attachment::ExternalChild) => {
                Some(Milestone::ExtChildrenDone)
            }
            Some(Milestone::ExtChildrenDone) if clear(Attachment::ExternalFollowOn) => {
                Some(Milestone::Finished)
            }
            _ => None,
        }
    }
}

/// Tasks added by one insertion
#[derive(Debug, Default)]
pub(crate) struct Inserted {
    pub(crate) added: Vec<TaskId>,
    pub(crate) ready: Vec<TaskId>,
}

/// Scheduling state of every task in a run.
///
/// Only the engine's coordinator mutates this, so completions are applied
/// one at a time.
#[derive(Default)]
pub(crate) struct LiveGraph {
    nodes: BTreeMap<TaskId, LiveNode>,
    waiters: HashMap<(TaskId, Milestone), Vec<TaskId>>,
}

impl LiveGraph {
    pub(crate) fn node(&self, id: TaskId) -> Option<&LiveNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn milestone(&self, id: TaskId) -> Option<Milestone> {
        self.nodes.get(&id).and_then(|n| n.reached)
    }

    /// Tasks that have not reached a terminal state
    pub(crate) fn unfinished(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.state.is_terminal())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Add a static graph (`spawner` = None) or a spawn batch.
    ///
    /// Nothing is modified unless the whole batch is valid.
    pub(crate) fn insert(&mut self, batch: TaskGraph, spawner: Option<TaskId>) -> Result<Inserted, GraphError> {
        let mut planned = Vec::with_capacity(batch.nodes.len());
        for (&id, decl) in &batch.nodes {
            if let Some((owner, _)) = decl.owner {
                if !batch.nodes.contains_key(&owner) && Some(owner) != spawner {
                    return Err(GraphError::UnknownTask(owner));
                }
            }
            planned.push((id, batch.deps_of(id, decl, self, spawner)?));
        }

        let incoming = planned
            .iter()
            .zip(batch.nodes.values())
            .map(|((id, deps), decl)| (*id, decl.owner, deps.as_slice()));
        match spawner {
            // Existing tasks never wait on a new batch, so a loop can only
            // close through the spawner's chain of owners
            Some(spawner) => {
                let ancestry = self.ancestry(spawner);
                let owners = ancestry
                    .iter()
                    .map(|&(id, owner)| (id, owner, &[] as &[(TaskId, Milestone)]));
                check_acyclic(owners.chain(incoming))?
            }
            None => {
                let existing = self
                    .nodes
                    .iter()
                    .map(|(&id, node)| (id, node.owner, node.deps.as_slice()));
                check_acyclic(existing.chain(incoming))?
            }
        }

        let mut inserted = Inserted::default();
        for ((id, deps), decl) in planned.into_iter().zip(batch.nodes.into_values()) {
            // Owners always have lower ids, so batch parents are already in place
            if let Some((owner, attachment)) = decl.owner {
                if let Some(parent) = self.nodes.get_mut(&owner) {
                    parent.outstanding[attachment.slot()] += 1;
                }
            }

            let mut pending_deps = 0;
            for &(producer, milestone) in &deps {
                let reached = self.milestone(producer).map_or(false, |m| m >= milestone);
                if !reached {
                    pending_deps += 1;
                    self.waiters.entry((producer, milestone)).or_default().push(id);
                }
            }

            let state = if pending_deps == 0 {
                inserted.ready.push(id);
                TaskState::Ready
            } else {
                TaskState::Pending
            };

            self.nodes.insert(
                id,
                LiveNode {
                    name: decl.spec.name().to_string(),
                    unit: decl.spec.unit_id().map(str::to_string),
                    cores: decl.spec.resources().cores,
                    spec: Some(decl.spec),
                    cell: decl.cell,
                    owner: decl.owner,
                    sealed: decl.sealed,
                    deps,
                    state,
                    pending_deps,
                    reached: None,
                    outstanding: [0; 4],
                },
            );
            inserted.added.push(id);
        }

        Ok(inserted)
    }

    /// `id` and its owners up to the root
    fn ancestry(&self, id: TaskId) -> Vec<(TaskId, Option<(TaskId, Attachment)>)> {
        std::iter::successors(Some(id), |current| {
            self.nodes.get(current).and_then(|n| n.owner).map(|(owner, _)| owner)
        })
        .map(|task| (task, self.nodes.get(&task).and_then(|n| n.owner)))
        .collect()
    }

    /// Move a ready task to running and hand out its spec
    pub(crate) fn start(&mut self, id: TaskId) -> Option<TaskSpec> {
        let node = self.nodes.get_mut(&id)?;
        node.state = TaskState::Running;
        node.spec.take()
    }

    /// Record a completed body; returns tasks that became ready
    pub(crate) fn complete(&mut self, id: TaskId, value: Arc<Value>) -> Vec<TaskId> {
        let mut ready = Vec::new();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = TaskState::Completed;
            node.cell.resolve(value);
            self.advance(id, &mut ready);
        }
        ready
    }

    /// Record a completed body whose result is discarded
    pub(crate) fn discard(&mut self, id: TaskId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = TaskState::Completed;
            node.cell.abandon();
        }
    }

    pub(crate) fn fail(&mut self, id: TaskId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = TaskState::Failed;
            node.spec = None;
            node.cell.abandon();
        }
    }

    /// Cancel every task that has not started; returns the cancelled ids
    pub(crate) fn cancel_waiting(&mut self) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for (&id, node) in self.nodes.iter_mut() {
            if matches!(node.state, TaskState::Pending | TaskState::Ready) {
                node.state = TaskState::Cancelled;
                node.spec = None;
                node.cell.abandon();
                cancelled.push(id);
            }
        }
        self.waiters.clear();
        cancelled
    }

    fn advance(&mut self, start: TaskId, ready: &mut Vec<TaskId>) {
        let mut work = vec![start];
        while let Some(id) = work.pop() {
            loop {
                let Some(node) = self.nodes.get_mut(&id) else {
                    break;
                };
                let Some(next) = node.next_milestone() else {
                    break;
                };
                node.reached = Some(next);
                let owner = node.owner;

                for waiter in self.waiters.remove(&(id, next)).unwrap_or_default() {
                    if let Some(w) = self.nodes.get_mut(&waiter) {
                        w.pending_deps = w.pending_deps.saturating_sub(1);
                        if w.pending_deps == 0 && w.state == TaskState::Pending {
                            w.state = TaskState::Ready;
                            ready.push(waiter);
                        }
                    }
                }

                if next == Milestone::Finished {
                    if let Some((parent, attachment)) = owner {
                        if let Some(p) = self.nodes.get_mut(&parent) {
                            p.outstanding[attachment.slot()] -= 1;
                            work.push(parent);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{FnBody, TaskSpec};
    use serde_json::json;

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::new(name, FnBody::new(|_| Ok(json!(null))))
    }

    fn run_to_end(live: &mut LiveGraph, mut ready: Vec<TaskId>) -> Vec<TaskId> {
        let mut order = Vec::new();
        while let Some(id) = ready.pop() {
            live.start(id);
            order.push(id);
            ready.extend(live.complete(id, Arc::new(json!(null))));
        }
        order
    }

    #[test]
    fn test_children_wait_for_parent_follow_on_waits_for_children() {
        let mut graph = TaskGraph::new();
        let root = graph.add_root(spec("root"));
        let a = graph.add_child(&root, spec("a")).unwrap();
        let b = graph.add_child(&root, spec("b")).unwrap();
        let after = graph.add_follow_on(&root, spec("after")).unwrap();

        let mut live = LiveGraph::default();
        let inserted = live.insert(graph, None).unwrap();
        assert_eq!(inserted.ready, vec![root.id()]);

        let order = run_to_end(&mut live, inserted.ready);
        let pos = |t: &TaskRef| order.iter().position(|&id| id == t.id()).unwrap();
        assert!(pos(&root) < pos(&a));
        assert!(pos(&a) < pos(&after));
        assert!(pos(&b) < pos(&after));
        assert_eq!(live.milestone(root.id()), Some(Milestone::Finished));
    }

    #[test]
    fn test_external_follow_on_waits_for_group() {
        let mut graph = TaskGraph::new();
        let group = graph.add_root(spec("group"));
        graph.encapsulate(&group).unwrap();
        let after = graph.add_follow_on(&group, spec("after")).unwrap();

        let mut live = LiveGraph::default();
        live.insert(graph, None).unwrap();
        live.start(group.id());

        // The group root spawns a child and an internal follow-on at runtime
        let mut batch = TaskGraph::spawn_batch(IdAllocator(Arc::new(AtomicU64::new(10))), group.id());
        let child = batch.attach_internal(group.id(), Relation::Child, spec("child"));
        let tail = batch.attach_internal(group.id(), Relation::FollowOn, spec("tail"));
        let spawned = live.insert(batch, Some(group.id())).unwrap();
        assert!(spawned.ready.is_empty());

        assert_eq!(live.complete(group.id(), Arc::new(json!(1))), vec![child.id()]);
        live.start(child.id());
        assert_eq!(live.complete(child.id(), Arc::new(json!(2))), vec![tail.id()]);
        live.start(tail.id());
        assert_eq!(live.complete(tail.id(), Arc::new(json!(3))), vec![after.id()]);
        assert_eq!(live.milestone(group.id()), Some(Milestone::ExtChildrenDone));
    }

    #[test]
    fn test_spawn_depending_on_running_task_is_back_edge() {
        let mut graph = TaskGraph::new();
        let root = graph.add_root(spec("root"));
        let a = graph.add_child(&root, spec("a")).unwrap();
        let b = graph.add_child(&root, spec("b")).unwrap();
        let ids = graph.ids().clone();

        let mut live = LiveGraph::default();
        live.insert(graph, None).unwrap();
        live.start(root.id());
        live.complete(root.id(), Arc::new(json!(null)));
        live.start(a.id());
        live.start(b.id());

        let mut batch = TaskGraph::spawn_batch(ids, a.id());
        batch.attach_internal(a.id(), Relation::Child, spec("reader").input("b", &b));
        let err = live.insert(batch, Some(a.id())).unwrap_err();
        assert!(matches!(err, GraphError::BackEdge { dependency, .. } if dependency == b.id()));
    }

    #[test]
    fn test_reading_own_group_is_a_cycle() {
        let mut graph = TaskGraph::new();
        let group = graph.add_root(spec("group"));
        graph.add_child(&group, spec("inner").input("group", &group)).unwrap();
        graph.encapsulate(&group).unwrap();

        assert!(matches!(graph.validate(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_unknown_parent() {
        let mut other = TaskGraph::new();
        for name in ["a", "b", "c"] {
            other.add_root(spec(name));
        }
        let stranger = other.add_root(spec("d"));

        let mut graph = TaskGraph::new();
        graph.add_root(spec("root"));
        assert_eq!(
            graph.add_child(&stranger, spec("x")).unwrap_err(),
            GraphError::UnknownTask(stranger.id())
        );
    }
}
