use std::collections::{HashMap, HashSet};

use kick_protocol::{CompletionCounter, SurfaceId, counter_reached};
use slotmap::SlotMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::TrackerError;

slotmap::new_key_type! {
    pub struct TrackedResourceKey;
}

pub type ResourceName = u32;

/// Name carried by resources that never enter a namespace (auxiliary buffers and the like).
pub const UNNAMED: ResourceName = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    BufferObject,
    Texture,
    ShaderCode,
    VertexLayout,
    DepthStencilBuffer,
}

/// Who holds the backing memory of a tracked resource.
#[derive(Debug)]
pub enum ResourceHandle<A> {
    /// The API object behind `name` still owns its allocation.
    Owned(ResourceName),
    /// The name is gone; the tracker owns the allocation until every link retires.
    Ghost(A),
}

/// One surface's claim on a resource: it stays needed until `counter` reaches `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseLink {
    pub surface: SurfaceId,
    pub counter: CompletionCounter,
    pub target: u32,
}

impl UseLink {
    pub fn is_retired(&self) -> bool {
        self.counter.is_reached(self.target)
    }
}

#[derive(Debug)]
struct TrackedNode<A> {
    kind: ResourceKind,
    handle: ResourceHandle<A>,
    links: SmallVec<[UseLink; 2]>,
}

impl<A> TrackedNode<A> {
    fn is_still_needed(&self) -> bool {
        self.links.iter().any(|link| !link.is_retired())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GhostOutcome<A> {
    /// Nothing in flight referenced the resource; the caller frees it now.
    FreeNow(A),
    /// The tracker keeps the allocation alive until the pending kicks retire.
    Ghosted,
}

/// A refused ghost hands the allocation back so the caller keeps ownership.
#[derive(Debug, PartialEq, Eq)]
pub struct GhostError<A> {
    pub reason: TrackerError,
    pub allocation: A,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReclaimReport<A> {
    pub unlinked: usize,
    pub freed: Vec<A>,
}

impl<A> ReclaimReport<A> {
    pub fn is_empty(&self) -> bool {
        self.unlinked == 0 && self.freed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceDetach {
    pub unlinked: usize,
    pub still_pending: Vec<TrackedResourceKey>,
}

/// Per-resource-group record of which kicks may still read which resources.
#[derive(Debug)]
pub struct KickResourceTracker<A> {
    nodes: SlotMap<TrackedResourceKey, TrackedNode<A>>,
    in_use_by_surface: HashMap<SurfaceId, HashSet<TrackedResourceKey>>,
}

impl<A> Default for KickResourceTracker<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> KickResourceTracker<A> {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            in_use_by_surface: HashMap::new(),
        }
    }

    pub fn track(&mut self, kind: ResourceKind, name: ResourceName) -> TrackedResourceKey {
        self.nodes.insert(TrackedNode {
            kind,
            handle: ResourceHandle::Owned(name),
            links: SmallVec::new(),
        })
    }

    pub fn contains(&self, key: TrackedResourceKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn kind(&self, key: TrackedResourceKey) -> Option<ResourceKind> {
        self.nodes.get(key).map(|node| node.kind)
    }

    pub fn is_ghost(&self, key: TrackedResourceKey) -> bool {
        self.nodes
            .get(key)
            .is_some_and(|node| matches!(node.handle, ResourceHandle::Ghost(_)))
    }

    pub fn tracked_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn ghost_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| matches!(node.handle, ResourceHandle::Ghost(_)))
            .count()
    }

    pub fn resources_in_use_by(&self, surface: SurfaceId) -> usize {
        self.in_use_by_surface
            .get(&surface)
            .map_or(0, |resources| resources.len())
    }

    /// Link `key` into `surface`'s in-use list until `counter` reaches `target`.
    ///
    /// Returns `false` when the surface already holds a pending link on `counter` that reaches
    /// at least as far. A pending link with an earlier target is moved forward, and a link
    /// whose target has already retired is refreshed.
    pub fn register_use(
        &mut self,
        surface: SurfaceId,
        key: TrackedResourceKey,
        counter: &CompletionCounter,
        target: u32,
    ) -> Result<bool, TrackerError> {
        let Some(node) = self.nodes.get_mut(key) else {
            return Err(TrackerError::UnknownResource { key });
        };
        if matches!(node.handle, ResourceHandle::Ghost(_)) {
            return Err(TrackerError::GhostedResourceUse { key });
        }

        if let Some(link) = node
            .links
            .iter_mut()
            .find(|link| link.surface == surface && link.counter.same_counter(counter))
        {
            if !link.is_retired() {
                if counter_reached(link.target, target) {
                    return Ok(false);
                }
                trace!(
                    surface,
                    ?key,
                    from = link.target,
                    target,
                    "moved pending resource link forward"
                );
                link.target = target;
                return Ok(true);
            }
            link.target = target;
            trace!(surface, ?key, target, "refreshed retired resource link");
            return Ok(true);
        }

        node.links.push(UseLink {
            surface,
            counter: counter.clone(),
            target,
        });
        self.in_use_by_surface
            .entry(surface)
            .or_default()
            .insert(key);
        trace!(surface, ?key, target, "linked resource into surface in-use list");
        Ok(true)
    }

    pub fn is_still_needed(&self, key: TrackedResourceKey) -> bool {
        self.nodes
            .get(key)
            .is_some_and(TrackedNode::is_still_needed)
    }

    pub fn pending_links(&self, key: TrackedResourceKey) -> SmallVec<[UseLink; 2]> {
        let Some(node) = self.nodes.get(key) else {
            return SmallVec::new();
        };
        node.links
            .iter()
            .filter(|link| !link.is_retired())
            .cloned()
            .collect()
    }

    /// Detach the logical object from `key` and take over `allocation`.
    pub fn ghost(
        &mut self,
        key: TrackedResourceKey,
        allocation: A,
    ) -> Result<GhostOutcome<A>, GhostError<A>> {
        let Some(node) = self.nodes.get_mut(key) else {
            return Err(GhostError {
                reason: TrackerError::UnknownResource { key },
                allocation,
            });
        };
        if matches!(node.handle, ResourceHandle::Ghost(_)) {
            return Err(GhostError {
                reason: TrackerError::AlreadyGhosted { key },
                allocation,
            });
        }

        if !node.is_still_needed() {
            self.remove_node(key);
            return Ok(GhostOutcome::FreeNow(allocation));
        }

        node.handle = ResourceHandle::Ghost(allocation);
        debug!(?key, kind = ?node.kind, links = node.links.len(), "ghosted in-flight resource");
        Ok(GhostOutcome::Ghosted)
    }

    /// Stop tracking a resource whose owner is about to free it.
    pub fn release(&mut self, key: TrackedResourceKey) -> Result<(), TrackerError> {
        let Some(node) = self.nodes.get(key) else {
            return Err(TrackerError::UnknownResource { key });
        };
        if matches!(node.handle, ResourceHandle::Ghost(_)) {
            return Err(TrackerError::AlreadyGhosted { key });
        }
        if node.is_still_needed() {
            return Err(TrackerError::ResourceStillInUse { key });
        }
        self.remove_node(key);
        Ok(())
    }

    /// Unlink every retired link and hand back ghosts nothing references any more.
    pub fn reclaim_retired(&mut self) -> ReclaimReport<A> {
        let mut unlinked = 0;
        let mut dead_ghosts = Vec::new();

        for (key, node) in self.nodes.iter_mut() {
            let before = node.links.len();
            let in_use_by_surface = &mut self.in_use_by_surface;
            node.links.retain(|link| {
                if !link.is_retired() {
                    return true;
                }
                if let Some(resources) = in_use_by_surface.get_mut(&link.surface) {
                    resources.remove(&key);
                    if resources.is_empty() {
                        in_use_by_surface.remove(&link.surface);
                    }
                }
                false
            });
            unlinked += before - node.links.len();

            if node.links.is_empty() && matches!(node.handle, ResourceHandle::Ghost(_)) {
                dead_ghosts.push(key);
            }
        }

        let mut freed = Vec::with_capacity(dead_ghosts.len());
        for key in dead_ghosts {
            if let Some(node) = self.nodes.remove(key)
                && let ResourceHandle::Ghost(allocation) = node.handle
            {
                freed.push(allocation);
            }
        }

        if unlinked > 0 || !freed.is_empty() {
            debug!(unlinked, freed = freed.len(), "reclaimed retired resources");
        }
        ReclaimReport { unlinked, freed }
    }

    /// Drop a destroyed surface's retired links and report the ones still waiting on hardware.
    pub fn detach_surface(&mut self, surface: SurfaceId) -> SurfaceDetach {
        let Some(keys) = self.in_use_by_surface.remove(&surface) else {
            return SurfaceDetach {
                unlinked: 0,
                still_pending: Vec::new(),
            };
        };

        let mut unlinked = 0;
        let mut still_pending = Vec::new();
        for key in keys {
            let Some(node) = self.nodes.get_mut(key) else {
                continue;
            };
            let before = node.links.len();
            node.links
                .retain(|link| link.surface != surface || !link.is_retired());
            unlinked += before - node.links.len();
            if node.links.iter().any(|link| link.surface == surface) {
                still_pending.push(key);
            }
        }
        if !still_pending.is_empty() {
            self.in_use_by_surface
                .insert(surface, still_pending.iter().copied().collect());
        }
        SurfaceDetach {
            unlinked,
            still_pending,
        }
    }

    fn remove_node(&mut self, key: TrackedResourceKey) {
        let Some(node) = self.nodes.remove(key) else {
            return;
        };
        for link in &node.links {
            if let Some(resources) = self.in_use_by_surface.get_mut(&link.surface) {
                resources.remove(&key);
                if resources.is_empty() {
                    self.in_use_by_surface.remove(&link.surface);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct FakeAllocation(u32);

    fn tracker_with_texture() -> (KickResourceTracker<FakeAllocation>, TrackedResourceKey) {
        let mut tracker = KickResourceTracker::new();
        let key = tracker.track(ResourceKind::Texture, 7);
        (tracker, key)
    }

    #[test]
    fn register_use_is_idempotent_while_pending() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::new();

        assert_eq!(tracker.register_use(1, key, &counter, 1), Ok(true));
        assert_eq!(tracker.register_use(1, key, &counter, 1), Ok(false));
        assert_eq!(tracker.pending_links(key)[0].target, 1);
        assert_eq!(tracker.resources_in_use_by(1), 1);
    }

    #[test]
    fn later_use_moves_pending_link_forward() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::starting_at(u32::MAX - 1);
        tracker
            .register_use(1, key, &counter, u32::MAX)
            .expect("link for first scene");

        assert_eq!(tracker.register_use(1, key, &counter, 0), Ok(true));
        assert_eq!(tracker.register_use(1, key, &counter, u32::MAX), Ok(false));
        assert_eq!(tracker.pending_links(key).len(), 1);
        assert_eq!(tracker.pending_links(key)[0].target, 0);

        counter.signal(u32::MAX);
        assert!(tracker.is_still_needed(key));
        counter.signal(0);
        assert!(!tracker.is_still_needed(key));
    }

    #[test]
    fn ghost_outlives_earlier_scene_when_reused_by_a_later_one() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::new();
        tracker
            .register_use(1, key, &counter, 1)
            .expect("link for first scene");
        tracker
            .register_use(1, key, &counter, 2)
            .expect("link for second scene");
        assert_eq!(
            tracker.ghost(key, FakeAllocation(7)).ok(),
            Some(GhostOutcome::Ghosted)
        );

        counter.signal(1);
        assert!(tracker.reclaim_retired().freed.is_empty());

        counter.signal(2);
        assert_eq!(tracker.reclaim_retired().freed, vec![FakeAllocation(7)]);
    }

    #[test]
    fn retired_link_is_refreshed_on_reuse() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::new();
        tracker
            .register_use(1, key, &counter, 1)
            .expect("link texture");
        counter.signal(1);
        assert!(!tracker.is_still_needed(key));

        assert_eq!(tracker.register_use(1, key, &counter, 2), Ok(true));

        assert!(tracker.is_still_needed(key));
    }

    #[test]
    fn registered_then_confirmed_is_reclaimed_exactly_once() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::new();
        tracker
            .register_use(3, key, &counter, 1)
            .expect("link texture");

        let before = tracker.reclaim_retired();
        assert!(before.is_empty());

        counter.signal(1);
        let first = tracker.reclaim_retired();
        let second = tracker.reclaim_retired();

        assert_eq!(first.unlinked, 1);
        assert!(second.is_empty());
        assert_eq!(tracker.resources_in_use_by(3), 0);
        assert!(tracker.contains(key));
    }

    #[test]
    fn ghost_keeps_allocation_until_every_surface_retires() {
        let (mut tracker, key) = tracker_with_texture();
        let first_counter = CompletionCounter::new();
        let second_counter = CompletionCounter::new();
        tracker
            .register_use(1, key, &first_counter, 1)
            .expect("link into first surface");
        tracker
            .register_use(2, key, &second_counter, 4)
            .expect("link into second surface");

        assert_eq!(
            tracker.ghost(key, FakeAllocation(9)),
            Ok(GhostOutcome::Ghosted)
        );
        assert!(tracker.is_ghost(key));

        first_counter.signal(1);
        assert!(tracker.reclaim_retired().freed.is_empty());
        assert_eq!(tracker.ghost_count(), 1);

        second_counter.signal(4);
        let report = tracker.reclaim_retired();

        assert_eq!(report.freed, vec![FakeAllocation(9)]);
        assert!(!tracker.contains(key));
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn ghost_of_idle_resource_frees_immediately() {
        let (mut tracker, key) = tracker_with_texture();

        assert_eq!(
            tracker.ghost(key, FakeAllocation(1)),
            Ok(GhostOutcome::FreeNow(FakeAllocation(1)))
        );
        assert!(!tracker.contains(key));
    }

    #[test]
    fn refused_ghost_returns_allocation() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::new();
        tracker
            .register_use(1, key, &counter, 1)
            .expect("link texture");
        tracker
            .ghost(key, FakeAllocation(1))
            .expect("first ghost succeeds");

        let error = tracker
            .ghost(key, FakeAllocation(2))
            .expect_err("second ghost refused");

        assert_eq!(error.reason, TrackerError::AlreadyGhosted { key });
        assert_eq!(error.allocation, FakeAllocation(2));
        assert_eq!(
            tracker.register_use(1, key, &counter, 2),
            Err(TrackerError::GhostedResourceUse { key })
        );
    }

    #[test]
    fn release_refuses_while_still_needed() {
        let (mut tracker, key) = tracker_with_texture();
        let counter = CompletionCounter::new();
        tracker
            .register_use(1, key, &counter, 1)
            .expect("link texture");

        assert_eq!(
            tracker.release(key),
            Err(TrackerError::ResourceStillInUse { key })
        );

        counter.signal(1);
        assert_eq!(tracker.release(key), Ok(()));
        assert_eq!(tracker.resources_in_use_by(1), 0);
    }

    #[test]
    fn detach_surface_reports_pending_links_only() {
        let mut tracker = KickResourceTracker::<FakeAllocation>::new();
        let retired = tracker.track(ResourceKind::ShaderCode, 1);
        let pending = tracker.track(ResourceKind::BufferObject, 2);
        let counter = CompletionCounter::new();
        tracker
            .register_use(5, retired, &counter, 1)
            .expect("link shader");
        tracker
            .register_use(5, pending, &counter, 2)
            .expect("link buffer");
        counter.signal(1);

        let detach = tracker.detach_surface(5);

        assert_eq!(detach.unlinked, 1);
        assert_eq!(detach.still_pending, vec![pending]);
        assert_eq!(tracker.resources_in_use_by(5), 1);
    }
}
