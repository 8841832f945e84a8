use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use completion_waiter::{BoundedRetry, Clock, RetryConfig, RetryPause};
use kick_protocol::{CompletionCounter, SurfaceId};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::TrackerError;
use crate::tracker::{
    GhostError, GhostOutcome, KickResourceTracker, ReclaimReport, ResourceKind, ResourceName,
    SurfaceDetach, TrackedResourceKey, UNNAMED, UseLink,
};

/// Lets a resource wait push out the work that would otherwise keep it referenced forever.
pub trait ForceKick {
    /// Whether `surface` holds recorded work that has not reached the hardware yet.
    fn has_unflushed_work(&self, surface: SurfaceId) -> bool;

    /// Send `surface`'s recorded work to the hardware with a render-counter update, leaving its
    /// scene open. Returns `false` when no kick could be issued.
    fn force_kick(&mut self, surface: SurfaceId) -> bool;
}

#[derive(Debug)]
struct NamedResource<A> {
    key: TrackedResourceKey,
    allocation: A,
}

/// API-visible names for tracked resources. Deleted names are handed out again lowest first.
#[derive(Debug)]
pub struct ResourceNamespace<A> {
    entries: HashMap<ResourceName, NamedResource<A>>,
    free_names: BTreeSet<ResourceName>,
    next_name: ResourceName,
}

impl<A> Default for ResourceNamespace<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ResourceNamespace<A> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            free_names: BTreeSet::new(),
            next_name: UNNAMED + 1,
        }
    }

    pub fn allocate_name(&mut self) -> ResourceName {
        if let Some(name) = self.free_names.pop_first() {
            return name;
        }
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    pub fn bind(&mut self, name: ResourceName, key: TrackedResourceKey, allocation: A) {
        self.free_names.remove(&name);
        if name >= self.next_name {
            self.free_names.extend(self.next_name..name);
            self.next_name = name + 1;
        }
        let previous = self.entries.insert(name, NamedResource { key, allocation });
        assert!(previous.is_none(), "resource name {name} bound twice");
    }

    pub fn key(&self, name: ResourceName) -> Option<TrackedResourceKey> {
        self.entries.get(&name).map(|entry| entry.key)
    }

    pub fn allocation(&self, name: ResourceName) -> Option<&A> {
        self.entries.get(&name).map(|entry| &entry.allocation)
    }

    pub fn remove(&mut self, name: ResourceName) -> Option<(TrackedResourceKey, A)> {
        let entry = self.entries.remove(&name)?;
        self.free_names.insert(name);
        Some((entry.key, entry.allocation))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct GroupState<A> {
    tracker: KickResourceTracker<A>,
    namespace: ResourceNamespace<A>,
}

/// A shared resource group: tracker and namespace behind one lock.
///
/// Every method takes the lock for the duration of the call only. Nothing here waits on
/// hardware while holding it, and freed allocations are handed back to the caller so they are
/// dropped after the lock is released.
#[derive(Debug)]
pub struct ResourceGroup<A> {
    state: Mutex<GroupState<A>>,
}

impl<A> Default for ResourceGroup<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ResourceGroup<A> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GroupState {
                tracker: KickResourceTracker::new(),
                namespace: ResourceNamespace::new(),
            }),
        }
    }

    /// Every method leaves the state consistent before it can panic, so a poisoned lock is
    /// still usable.
    fn lock(&self) -> MutexGuard<'_, GroupState<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, kind: ResourceKind, allocation: A) -> (ResourceName, TrackedResourceKey) {
        let mut state = self.lock();
        let name = state.namespace.allocate_name();
        let key = state.tracker.track(kind, name);
        state.namespace.bind(name, key, allocation);
        trace!(name, ?key, ?kind, "created named resource");
        (name, key)
    }

    /// Track a driver-internal resource that has no API name.
    pub fn track_unnamed(&self, kind: ResourceKind) -> TrackedResourceKey {
        self.lock().tracker.track(kind, UNNAMED)
    }

    pub fn key_for(&self, name: ResourceName) -> Option<TrackedResourceKey> {
        self.lock().namespace.key(name)
    }

    pub fn register_use(
        &self,
        surface: SurfaceId,
        key: TrackedResourceKey,
        counter: &CompletionCounter,
        target: u32,
    ) -> Result<bool, TrackerError> {
        self.lock()
            .tracker
            .register_use(surface, key, counter, target)
    }

    pub fn register_named_use(
        &self,
        surface: SurfaceId,
        name: ResourceName,
        counter: &CompletionCounter,
        target: u32,
    ) -> Result<bool, TrackerError> {
        let mut state = self.lock();
        let key = state
            .namespace
            .key(name)
            .ok_or(TrackerError::UnknownName { name })?;
        state.tracker.register_use(surface, key, counter, target)
    }

    pub fn is_still_needed(&self, key: TrackedResourceKey) -> bool {
        self.lock().tracker.is_still_needed(key)
    }

    pub fn is_ghost(&self, key: TrackedResourceKey) -> bool {
        self.lock().tracker.is_ghost(key)
    }

    pub fn pending_links(&self, key: TrackedResourceKey) -> SmallVec<[UseLink; 2]> {
        self.lock().tracker.pending_links(key)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().tracker.tracked_count()
    }

    pub fn named_count(&self) -> usize {
        self.lock().namespace.len()
    }

    /// Delete the API object behind `name`.
    ///
    /// The name is free for reuse as soon as this returns `Ok`. When a kick still references
    /// the resource its allocation lives on as a ghost; otherwise it comes back as
    /// [`GhostOutcome::FreeNow`]. On error the name stays bound.
    pub fn delete(&self, name: ResourceName) -> Result<GhostOutcome<A>, TrackerError> {
        let mut state = self.lock();
        let (key, allocation) = state
            .namespace
            .remove(name)
            .ok_or(TrackerError::UnknownName { name })?;
        match state.tracker.ghost(key, allocation) {
            Ok(outcome) => {
                debug!(
                    name,
                    ?key,
                    ghosted = matches!(outcome, GhostOutcome::Ghosted),
                    "deleted resource"
                );
                Ok(outcome)
            }
            Err(GhostError { reason, allocation }) => {
                state.namespace.bind(name, key, allocation);
                Err(reason)
            }
        }
    }

    pub fn ghost_unnamed(
        &self,
        key: TrackedResourceKey,
        allocation: A,
    ) -> Result<GhostOutcome<A>, GhostError<A>> {
        self.lock().tracker.ghost(key, allocation)
    }

    pub fn release(&self, key: TrackedResourceKey) -> Result<(), TrackerError> {
        self.lock().tracker.release(key)
    }

    /// The returned allocations are dropped by the caller, outside the group lock.
    pub fn reclaim_retired(&self) -> ReclaimReport<A> {
        self.lock().tracker.reclaim_retired()
    }

    pub fn detach_surface(&self, surface: SurfaceId) -> SurfaceDetach {
        self.lock().tracker.detach_surface(surface)
    }

    /// Make sure the work referencing `key` reaches the hardware, then poll until it retires.
    ///
    /// Each surface holding a pending link is kicked at most once. Returns `false` when the
    /// resource is still referenced after `retry.max_retries` back-off periods.
    pub fn wait_until_not_needed(
        &self,
        key: TrackedResourceKey,
        retry: RetryConfig,
        clock: &dyn Clock,
        kicker: &mut dyn ForceKick,
    ) -> bool {
        let links = self.pending_links(key);
        if links.is_empty() {
            return true;
        }

        let mut kicked: SmallVec<[SurfaceId; 2]> = SmallVec::new();
        for link in &links {
            if kicked.contains(&link.surface) {
                continue;
            }
            kicked.push(link.surface);
            if kicker.has_unflushed_work(link.surface) && !kicker.force_kick(link.surface) {
                warn!(surface = link.surface, ?key, "forced kick for resource wait failed");
            }
        }

        match BoundedRetry::new(retry).run(clock, RetryPause::Backoff, None, || {
            !self.is_still_needed(key)
        }) {
            Ok(report) => {
                trace!(?key, attempts = report.attempts, "resource no longer needed");
                true
            }
            Err(error) => {
                warn!(?key, ?error, "resource still in use after bounded wait");
                false
            }
        }
    }
}
