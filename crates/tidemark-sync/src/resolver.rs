//! Dependency resolver
//!
//! Turns a set of fired, retried and in-flight changes into a forest of
//! [`DispatchUnit`]s. Every pair of changes with overlapping paths is
//! compared oldest first; the comparison either drops a change that turned
//! out to be a no-op, folds one change into another, or adds a
//! "must complete before" edge. The edges are then arranged into trees so
//! that top-level units can be dispatched in any order.
//!
//! Nodes live in an arena keyed by [`ChangeId`]; edges are id sets. An edge
//! that would close a cycle is refused, so the topological sort at the end
//! always succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tidemark_core::domain::{ChangeId, ChangeKind, DispatchUnit, LocalPath, PathCase, PendingChange};
use tracing::{debug, error, trace, warn};

/// Result of one resolver pass
#[derive(Debug, Default)]
pub struct Resolution {
    /// Top-level dependency trees, ordered by the id of their root
    pub units: Vec<DispatchUnit>,
    /// Changes that resolved to nothing
    pub dropped: Vec<PendingChange>,
    /// Changes merged into a later change
    pub absorbed: Vec<ChangeId>,
    /// `(earlier, later)` pairs where the earlier change now waits for the later one
    pub reorders: Vec<(ChangeId, ChangeId)>,
}

impl Resolution {
    /// Ids that left the pipeline without being dispatched
    pub fn discarded(&self) -> impl Iterator<Item = ChangeId> + '_ {
        self.dropped
            .iter()
            .map(|change| change.id)
            .chain(self.absorbed.iter().copied())
    }
}

#[derive(Debug)]
struct Node {
    change: PendingChange,
    deps: BTreeSet<ChangeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposal {
    Dropped,
    Absorbed,
}

/// Orders and folds changes before dispatch
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver {
    case: PathCase,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(case: PathCase) -> Self {
        Self { case }
    }

    /// Resolve one pass worth of changes
    ///
    /// Input order does not matter; changes are compared in id order.
    #[must_use]
    pub fn resolve(&self, changes: Vec<PendingChange>) -> Resolution {
        let mut graph = Graph::new(self.case);
        for mut change in changes {
            change.dependencies.clear();
            let id = change.id;
            let node = Node {
                change,
                deps: BTreeSet::new(),
            };
            if graph.nodes.insert(id, node).is_some() {
                warn!(id = %id, "Change submitted twice to the resolver; keeping the last copy");
            }
        }

        graph.compare_all();
        let resolution = graph.into_resolution();
        debug!(
            units = resolution.units.len(),
            dropped = resolution.dropped.len(),
            absorbed = resolution.absorbed.len(),
            reorders = resolution.reorders.len(),
            "Changes resolved"
        );
        resolution
    }
}

// ============================================================================
// Graph
// ============================================================================

struct Graph {
    case: PathCase,
    nodes: BTreeMap<ChangeId, Node>,
    dropped: Vec<PendingChange>,
    absorbed: Vec<ChangeId>,
    reorders: Vec<(ChangeId, ChangeId)>,
}

impl Graph {
    fn new(case: PathCase) -> Self {
        Self {
            case,
            nodes: BTreeMap::new(),
            dropped: Vec::new(),
            absorbed: Vec::new(),
            reorders: Vec::new(),
        }
    }

    fn change(&self, id: ChangeId) -> Option<&PendingChange> {
        self.nodes.get(&id).map(|node| &node.change)
    }

    fn change_mut(&mut self, id: ChangeId) -> Option<&mut PendingChange> {
        self.nodes.get_mut(&id).map(|node| &mut node.change)
    }

    fn is_in_flight(&self, id: ChangeId) -> bool {
        self.change(id).is_some_and(PendingChange::is_in_flight)
    }

    fn overlaps(&self, a: &PendingChange, b: &PendingChange) -> bool {
        a.paths()
            .any(|x| b.paths().any(|y| x.overlaps(y, self.case)))
    }

    fn compare_all(&mut self) {
        let ids: Vec<ChangeId> = self.nodes.keys().copied().collect();
        for (i, &earlier) in ids.iter().enumerate() {
            for &later in &ids[i + 1..] {
                if !self.nodes.contains_key(&earlier) {
                    break;
                }
                let (Some(a), Some(b)) = (self.change(earlier), self.change(later)) else {
                    continue;
                };
                if !self.overlaps(a, b) {
                    continue;
                }

                let kinds = (a.kind, b.kind);
                if kinds.0 == ChangeKind::Renamed || kinds.1 == ChangeKind::Renamed {
                    self.rename_check(earlier, later);
                } else if kinds.0 == ChangeKind::Deleted || kinds.1 == ChangeKind::Deleted {
                    self.delete_check(earlier, later);
                } else {
                    self.creation_check(earlier, later);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    /// Both changes are creations or modifications
    fn creation_check(&mut self, earlier: ChangeId, later: ChangeId) {
        let (Some(a), Some(b)) = (self.change(earlier).cloned(), self.change(later).cloned()) else {
            return;
        };
        let case = self.case;

        if a.path.same(&b.path, case) {
            if a.kind == ChangeKind::Created
                && b.kind == ChangeKind::Modified
                && !a.is_in_flight()
                && !b.is_in_flight()
            {
                if let Some(change) = self.change_mut(later) {
                    change.kind = ChangeKind::Created;
                }
                self.absorb(earlier, later);
            } else {
                self.depend(later, earlier);
            }
            return;
        }

        if a.kind == ChangeKind::Created && a.path.strictly_contains(&b.path, case) {
            self.depend(later, earlier);
        } else if b.kind == ChangeKind::Created && b.path.strictly_contains(&a.path, case) {
            self.depend(earlier, later);
        }
    }

    /// At least one change is a deletion, neither is a rename
    fn delete_check(&mut self, earlier: ChangeId, later: ChangeId) {
        let (Some(a), Some(b)) = (self.change(earlier).cloned(), self.change(later).cloned()) else {
            return;
        };
        let case = self.case;

        match (a.kind, b.kind) {
            (ChangeKind::Deleted, ChangeKind::Deleted) => {
                let dropped = if a.path.same(&b.path, case) || b.path.contains(&a.path, case) {
                    // Repeated delete, or a child deleted before its parent.
                    self.drop_node(earlier, Disposal::Dropped)
                } else {
                    // Descendant deleted after its ancestor.
                    self.drop_node(later, Disposal::Dropped)
                };
                if !dropped {
                    self.depend(later, earlier);
                }
            }
            (ChangeKind::Deleted, _) => {
                if a.path.same(&b.path, case) && b.kind == ChangeKind::Modified {
                    if let Some(change) = self.change_mut(later) {
                        change.kind = ChangeKind::Created;
                    }
                }
                self.depend(later, earlier);
            }
            (_, ChangeKind::Deleted) => {
                if !b.path.contains(&a.path, case) {
                    // A new folder whose descendant is deleted later.
                    self.depend(later, earlier);
                    return;
                }
                if a.kind == ChangeKind::Created
                    && a.path.same(&b.path, case)
                    && !a.is_in_flight()
                    && self.vanish_under(&b.path, later, Some(earlier))
                    && self.drop_node(earlier, Disposal::Dropped)
                {
                    debug!(created = %earlier, deleted = %later, path = %b.path, "Created and deleted in one pass");
                    self.drop_node(later, Disposal::Dropped);
                    return;
                }
                if !self.drop_node(earlier, Disposal::Dropped) {
                    self.depend(later, earlier);
                }
            }
            _ => self.creation_check(earlier, later),
        }
    }

    /// At least one change is a rename
    fn rename_check(&mut self, earlier: ChangeId, later: ChangeId) {
        if self.change(earlier).is_some_and(|c| c.kind == ChangeKind::Renamed) {
            self.rename_against(earlier, later);
        }
        if self.change(later).is_some_and(|c| c.kind == ChangeKind::Renamed)
            && self.nodes.contains_key(&earlier)
        {
            self.rename_against(later, earlier);
        }
    }

    /// Relate `other` to the rename `rename`
    fn rename_against(&mut self, rename: ChangeId, other: ChangeId) {
        let (Some(r), Some(c)) = (self.change(rename).cloned(), self.change(other).cloned()) else {
            return;
        };
        let Some(source) = r.old_path.clone() else {
            error!(id = %rename, "Renamed change without a source path");
            return;
        };
        let target = r.path.clone();
        let case = self.case;
        let other_earlier = other < rename;

        if c.kind == ChangeKind::Deleted && !other_earlier {
            if c.path.same(&target, case) {
                // Moved, then deleted: delete the original instead.
                if !r.is_in_flight()
                    && !c.is_in_flight()
                    && self.vanish_under(&target, other, Some(rename))
                {
                    if let Some(change) = self.change_mut(other) {
                        change.path = source;
                        change.metadata = r.metadata.clone();
                    }
                    self.drop_node(rename, Disposal::Absorbed);
                } else {
                    self.depend(other, rename);
                }
                return;
            }
            if c.path.strictly_contains(&target, case) {
                let internal = c.path.contains(&source, case);
                if !(internal && self.drop_node(rename, Disposal::Dropped)) {
                    self.depend(other, rename);
                }
                return;
            }
        }

        if c.kind == ChangeKind::Deleted && c.path.strictly_contains(&source, case) {
            self.depend(other, rename);
            return;
        }
        if c.kind == ChangeKind::Created
            && (c.path.strictly_contains(&target, case) || c.path.strictly_contains(&source, case))
        {
            self.depend(rename, other);
            return;
        }

        if c.paths().any(|x| source.contains(x, case)) {
            if !other_earlier {
                self.depend(other, rename);
            } else if r.is_in_flight() && !c.is_in_flight() {
                // The rename already runs; stale coordinates follow it.
                self.rebase(other, &source, &target);
                self.depend(other, rename);
            } else {
                self.depend(rename, other);
            }
            return;
        }

        if let Some(x) = c.paths().find(|x| target.contains(x, case)) {
            if other_earlier && x.same(&target, case) {
                self.depend(rename, other);
            } else {
                self.depend(other, rename);
            }
        };
    }

    // ------------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------------

    /// Add "`dependent` waits for `dependency`"
    fn depend(&mut self, dependent: ChangeId, dependency: ChangeId) {
        if dependent == dependency || !self.nodes.contains_key(&dependency) {
            return;
        }
        let Some(node) = self.nodes.get(&dependent) else {
            return;
        };
        if node.change.is_in_flight() {
            trace!(id = %dependent, on = %dependency, "In-flight change cannot wait; edge skipped");
            return;
        }
        if node.deps.contains(&dependency) {
            return;
        }
        if self.reaches(dependency, dependent) {
            error!(
                dependent = %dependent,
                dependency = %dependency,
                "Refusing dependency that would close a cycle"
            );
            return;
        }

        if let Some(node) = self.nodes.get_mut(&dependent) {
            node.deps.insert(dependency);
        }
        trace!(id = %dependent, on = %dependency, "Dependency added");
        if dependent < dependency {
            self.reorders.push((dependent, dependency));
        }
    }

    /// Whether `from` waits, directly or not, for `to`
    fn reaches(&self, from: ChangeId, to: ChangeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.deps.iter().copied());
            }
        }
        false
    }

    /// Remove a change; whoever waited for it now waits for its dependencies
    fn drop_node(&mut self, id: ChangeId, disposal: Disposal) -> bool {
        if self.is_in_flight(id) {
            debug!(id = %id, "In-flight change kept");
            return false;
        }
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        for other in self.nodes.values_mut() {
            if other.deps.remove(&id) && !other.change.is_in_flight() {
                other.deps.extend(node.deps.iter().copied());
            }
        }

        match disposal {
            Disposal::Dropped => {
                debug!(change = %node.change, "Change dropped");
                self.dropped.push(node.change);
            }
            Disposal::Absorbed => {
                debug!(change = %node.change, "Change absorbed");
                self.absorbed.push(id);
            }
        }
        true
    }

    /// Fold `from` into `into`, keeping every edge either had
    ///
    /// Refused when either side is in flight: a running change cannot take
    /// over work it was not started with.
    fn absorb(&mut self, from: ChangeId, into: ChangeId) -> bool {
        if self.is_in_flight(from) || self.is_in_flight(into) {
            return false;
        }
        let Some(node) = self.nodes.remove(&from) else {
            return false;
        };
        let mut dependents = Vec::new();
        for (id, other) in &mut self.nodes {
            if other.deps.remove(&from) && *id != into {
                dependents.push(*id);
            }
        }
        for dependency in node.deps {
            self.depend(into, dependency);
        }
        for dependent in dependents {
            self.depend(dependent, into);
        }

        debug!(from = %from, into = %into, "Change absorbed");
        self.absorbed.push(from);
        true
    }

    /// Drop every change made under `root` before `before`
    ///
    /// Used when `root` turns out to never reach the server. A rename moving
    /// something into `root` from outside becomes a deletion of its source.
    /// Nothing happens, and `false` is returned, if an in-flight change
    /// stands in the way.
    fn vanish_under(&mut self, root: &LocalPath, before: ChangeId, except: Option<ChangeId>) -> bool {
        let case = self.case;
        let inside: Vec<ChangeId> = self
            .nodes
            .range(..before)
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, node)| root.strictly_contains(&node.change.path, case))
            .map(|(id, _)| *id)
            .collect();
        if inside.iter().any(|id| self.is_in_flight(*id)) {
            return false;
        }

        for id in inside {
            let moved_in = self.change(id).and_then(|change| match &change.old_path {
                Some(source) if !root.contains(source, case) => Some(source.clone()),
                _ => None,
            });
            match moved_in {
                Some(source) => {
                    if let Some(change) = self.change_mut(id) {
                        debug!(id = %id, path = %source, "Rename into vanished folder becomes deletion");
                        change.kind = ChangeKind::Deleted;
                        change.path = source;
                        change.old_path = None;
                    }
                }
                None => {
                    self.drop_node(id, Disposal::Dropped);
                }
            }
        }
        true
    }

    fn rebase(&mut self, id: ChangeId, from: &LocalPath, to: &LocalPath) {
        let case = self.case;
        let Some(change) = self.change_mut(id) else {
            return;
        };
        if let Some(path) = change.path.rebase(from, to, case) {
            change.path = path;
        }
        if let Some(source) = change.old_path.as_ref().and_then(|s| s.rebase(from, to, case)) {
            change.old_path = Some(source);
        }
        debug!(change = %change, "Change rewritten to follow in-flight rename");
    }

    // ------------------------------------------------------------------------
    // Forest
    // ------------------------------------------------------------------------

    /// Kahn's algorithm, smallest id first among ready nodes
    fn topological_order(&self) -> Vec<ChangeId> {
        let mut waiting: HashMap<ChangeId, usize> = HashMap::new();
        let mut dependents: HashMap<ChangeId, Vec<ChangeId>> = HashMap::new();
        for (id, node) in &self.nodes {
            waiting.insert(*id, node.deps.len());
            for dep in &node.deps {
                dependents.entry(*dep).or_default().push(*id);
            }
        }

        let mut ready: BTreeSet<ChangeId> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(count) = waiting.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            error!(
                sorted = order.len(),
                total = self.nodes.len(),
                "Dependency cycle survived resolution"
            );
        }
        order
    }

    fn into_resolution(mut self) -> Resolution {
        let order = self.topological_order();

        let mut adopted_by: HashMap<ChangeId, ChangeId> = HashMap::new();
        let mut children: BTreeMap<ChangeId, BTreeSet<ChangeId>> = BTreeMap::new();
        for id in &order {
            let deps: Vec<ChangeId> = self
                .nodes
                .get(id)
                .map(|node| node.deps.iter().copied().collect())
                .unwrap_or_default();
            for dep in deps {
                let root = find_root(&adopted_by, dep);
                if root != *id {
                    adopted_by.insert(root, *id);
                    children.entry(*id).or_default().insert(root);
                }
            }
        }

        let tops: Vec<ChangeId> = order
            .iter()
            .copied()
            .filter(|id| !adopted_by.contains_key(id))
            .collect();
        let mut units = Vec::new();
        for top in tops {
            let lone = !children.contains_key(&top);
            if lone && self.is_in_flight(top) {
                continue;
            }
            if let Some(unit) = build_unit(&mut self.nodes, &children, top) {
                units.push(unit);
            }
        }
        units.sort_by_key(|unit| unit.change.id);

        Resolution {
            units,
            dropped: self.dropped,
            absorbed: self.absorbed,
            reorders: self.reorders,
        }
    }
}

fn find_root(adopted_by: &HashMap<ChangeId, ChangeId>, mut id: ChangeId) -> ChangeId {
    while let Some(parent) = adopted_by.get(&id) {
        id = *parent;
    }
    id
}

fn build_unit(
    nodes: &mut BTreeMap<ChangeId, Node>,
    children: &BTreeMap<ChangeId, BTreeSet<ChangeId>>,
    id: ChangeId,
) -> Option<DispatchUnit> {
    let mut change = nodes.remove(&id)?.change;
    let child_ids: Vec<ChangeId> = children
        .get(&id)
        .map(|set| set.iter().copied().collect())
        .unwrap_or_default();
    change.dependencies = child_ids.clone();
    let dependencies = child_ids
        .into_iter()
        .filter_map(|child| build_unit(nodes, children, child))
        .collect();
    Some(DispatchUnit {
        change,
        dependencies,
    })
}
