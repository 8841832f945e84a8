use std::collections::HashMap;
use std::sync::Arc;

use command_ring::{RingReserveError, RingSet};
use completion_waiter::{CancelToken, Clock, CompletionWaiter, EventWait, WaitKind};
use kick_protocol::{
    ClearFlags, CompletionCounter, DependencyHandle, DeviceAllocation, RingClass, ScheduleFlags,
    SurfaceId,
};
use kick_submit::{
    DeviceAllocator, FixedFunctionStateLayer, KernelServices, KickOutcome, KickSubmitter,
};
use render_surface::{RenderSurface, SceneState, SurfaceDescriptor};
use resource_tracker::{
    ForceKick, GhostError, GhostOutcome, ResourceGroup, ResourceKind, ResourceName,
    TrackedResourceKey,
};
use tracing::{debug, trace, warn};

use crate::{ApiError, DriverConfig, DriverError};

pub type SharedResources = Arc<ResourceGroup<DeviceAllocation>>;

/// Control-stream word that clears the tiles of a fresh scene; the low bits carry [`ClearFlags`].
const CLEAR_PRIMITIVE_OPCODE: u32 = 0xC1 << 24;

/// Collaborators a context drives.
pub struct DriverServices<K, L, A> {
    pub kernel: K,
    pub state_layer: L,
    pub allocator: A,
    pub rings: RingSet,
    pub event: Arc<dyn EventWait>,
    pub clock: Arc<dyn Clock>,
}

/// One drawing call: ring words per command class, the resources it reads, how many primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawRecord<'a> {
    pub blocks: &'a [(RingClass, &'a [u32])],
    pub resources: &'a [TrackedResourceKey],
    pub primitives: u32,
}

pub struct DriverContext<K, L, A> {
    config: DriverConfig,
    submitter: KickSubmitter<K>,
    state_layer: L,
    allocator: A,
    rings: RingSet,
    surfaces: HashMap<SurfaceId, RenderSurface>,
    next_surface_id: SurfaceId,
    /// Surface whose words sit unsubmitted in the rings.
    recording_surface: Option<SurfaceId>,
    resources: SharedResources,
    waiter: CompletionWaiter,
    api_error: Option<ApiError>,
}

impl<K, L, A> DriverContext<K, L, A>
where
    K: KernelServices,
    L: FixedFunctionStateLayer,
    A: DeviceAllocator,
{
    pub fn new(
        config: DriverConfig,
        services: DriverServices<K, L, A>,
        resources: SharedResources,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let waiter = CompletionWaiter::new(
            config.command_stream_wait,
            config.render_wait,
            services.clock,
            services.event,
        );
        Ok(Self {
            config,
            submitter: KickSubmitter::new(services.kernel),
            state_layer: services.state_layer,
            allocator: services.allocator,
            rings: services.rings,
            surfaces: HashMap::new(),
            next_surface_id: 1,
            recording_surface: None,
            resources,
            waiter,
            api_error: None,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        self.submitter.kernel()
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        self.submitter.kernel_mut()
    }

    pub fn state_layer(&self) -> &L {
        &self.state_layer
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn rings(&self) -> &RingSet {
        &self.rings
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.waiter.cancel_token()
    }

    pub fn surface(&self, surface: SurfaceId) -> Option<&RenderSurface> {
        self.surfaces.get(&surface)
    }

    /// For the state layer's register setters.
    pub fn surface_mut(&mut self, surface: SurfaceId) -> Option<&mut RenderSurface> {
        self.surfaces.get_mut(&surface)
    }

    /// The first error latched since the last call, as the drawing API reports it.
    pub fn take_api_error(&mut self) -> Option<ApiError> {
        self.api_error.take()
    }

    pub fn create_surface(
        &mut self,
        descriptor: SurfaceDescriptor,
    ) -> Result<SurfaceId, DriverError> {
        let id = self.next_surface_id;
        let result = RenderSurface::new(id, descriptor).map_err(DriverError::from);
        let surface = self.latched(result)?;
        self.next_surface_id += 1;
        self.surfaces.insert(id, surface);
        debug!(
            surface = id,
            width = descriptor.width,
            height = descriptor.height,
            "created surface"
        );
        Ok(id)
    }

    /// Open a scene on `surface` if none is open and emit any pending clear.
    pub fn prepare_to_draw(&mut self, surface: SurfaceId, clear: ClearFlags) -> bool {
        let result = self.prepare_to_draw_inner(surface, clear);
        self.latched(result).is_ok()
    }

    pub fn queue_primitives(
        &mut self,
        surface: SurfaceId,
        draw: DrawRecord<'_>,
    ) -> Result<(), DriverError> {
        let result = self.queue_primitives_inner(surface, draw);
        self.latched(result)
    }

    pub fn schedule_kick(
        &mut self,
        surface: SurfaceId,
        flags: ScheduleFlags,
    ) -> Result<KickOutcome, DriverError> {
        let result = self.schedule_kick_inner(surface, flags);
        self.latched(result)
    }

    /// Ring callback: one kick's worth of `class` data is queued, so kick without closing the
    /// scene.
    pub fn on_ring_kick_capacity_exceeded(
        &mut self,
        surface: SurfaceId,
        class: RingClass,
    ) -> Result<(), DriverError> {
        let result = self.overflow_kick(surface, class);
        self.latched(result)
    }

    pub fn wait_for_command_stream(&mut self, surface: SurfaceId) -> Result<(), DriverError> {
        let result = self.wait_for_command_stream_inner(surface);
        self.latched(result)
    }

    pub fn wait_for_render_completion(&mut self, surface: SurfaceId) -> Result<(), DriverError> {
        let result = self.wait_for_render_inner(surface);
        self.latched(result)
    }

    /// Present: close the scene and end the display surface's frame.
    pub fn end_frame(&mut self, surface: SurfaceId) -> Result<KickOutcome, DriverError> {
        self.schedule_kick(
            surface,
            ScheduleFlags::LAST_IN_SCENE | ScheduleFlags::END_EXTERNAL_FRAME,
        )
    }

    pub fn abort_scene(&mut self, surface: SurfaceId) -> Result<KickOutcome, DriverError> {
        self.schedule_kick(surface, ScheduleFlags::ABORT)
    }

    /// Make `surface`'s next kick wait for everything `source` has rendered so far.
    pub fn add_source_dependency(
        &mut self,
        surface: SurfaceId,
        source: SurfaceId,
    ) -> Result<(), DriverError> {
        let result = self.add_source_dependency_inner(surface, source);
        self.latched(result)
    }

    pub fn resize_surface(
        &mut self,
        surface: SurfaceId,
        width: u32,
        height: u32,
    ) -> Result<(), DriverError> {
        let result = self.resize_surface_inner(surface, width, height);
        self.latched(result)
    }

    pub fn create_resource(
        &mut self,
        kind: ResourceKind,
        bytes: u64,
    ) -> Result<(ResourceName, TrackedResourceKey), DriverError> {
        let result = self
            .allocator
            .allocate(bytes)
            .ok_or(DriverError::OutOfDeviceMemory { bytes });
        let allocation = self.latched(result)?;
        Ok(self.resources.create(kind, allocation))
    }

    /// Delete the API object behind `name`. The name is reusable on return; the memory lives on
    /// as a ghost while a kick may still read it.
    pub fn delete_resource(&mut self, name: ResourceName) -> Result<(), DriverError> {
        let result = self.resources.delete(name).map_err(DriverError::from);
        match self.latched(result)? {
            GhostOutcome::FreeNow(allocation) => self.allocator.free(allocation),
            GhostOutcome::Ghosted => trace!(name, "resource ghosted until its kicks retire"),
        }
        Ok(())
    }

    /// Push out the work that references `key` and wait, with back-off, until it retires.
    pub fn wait_until_not_needed(&mut self, key: TrackedResourceKey) -> bool {
        let resources = Arc::clone(&self.resources);
        let clock = Arc::clone(self.waiter.clock());
        let retry = self.config.resource_wait;
        let idle = resources.wait_until_not_needed(
            key,
            retry,
            clock.as_ref(),
            &mut PartialRenderKicker { context: self },
        );
        if idle {
            self.reclaim_retired();
        } else if self.api_error.is_none() {
            self.api_error = Some(ApiError::OperationFailed);
        }
        idle
    }

    /// Tear down `surface`: abort any open scene, then wait for its renders. On timeout the
    /// auxiliary buffer is ghosted and its links stay until their counters retire.
    pub fn destroy_surface(&mut self, surface: SurfaceId) -> Result<(), DriverError> {
        let result = self.destroy_surface_inner(surface);
        self.latched(result)
    }

    /// Free ghosts whose kicks have all retired. Returns how many allocations were freed.
    pub fn reclaim_retired(&mut self) -> usize {
        let report = self.resources.reclaim_retired();
        let freed = report.freed.len();
        for allocation in report.freed {
            self.allocator.free(allocation);
        }
        freed
    }

    fn prepare_to_draw_inner(
        &mut self,
        surface_id: SurfaceId,
        clear: ClearFlags,
    ) -> Result<(), DriverError> {
        self.surface_or_err(surface_id)?;
        self.flush_other_surface(surface_id)?;

        let surface = self.surface_mut_or_err(surface_id)?;
        if surface.open_scene() {
            trace!(surface = surface_id, "scene opened for drawing");
        }
        surface.request_clear(clear);
        let pending_clear = surface.take_pending_clear();
        if pending_clear.is_empty() {
            return Ok(());
        }

        let words = [CLEAR_PRIMITIVE_OPCODE | pending_clear.bits()];
        if let Err(error) = self.write_words(surface_id, RingClass::ControlStream, &words) {
            self.surface_mut_or_err(surface_id)?.request_clear(pending_clear);
            return Err(error);
        }
        self.surface_mut_or_err(surface_id)?.record_primitives(1);
        Ok(())
    }

    fn queue_primitives_inner(
        &mut self,
        surface_id: SurfaceId,
        draw: DrawRecord<'_>,
    ) -> Result<(), DriverError> {
        if self.surface_or_err(surface_id)?.scene_state() == SceneState::Idle {
            return Err(DriverError::SceneNotOpen {
                surface: surface_id,
            });
        }
        self.flush_other_surface(surface_id)?;

        for (class, words) in draw.blocks {
            self.write_words(surface_id, *class, words)?;
        }

        let counter = self.surface_or_err(surface_id)?.render_counter().clone();
        let target = counter.pending_value();
        for key in draw.resources {
            self.resources.register_use(surface_id, *key, &counter, target)?;
        }
        self.surface_mut_or_err(surface_id)?
            .record_primitives(draw.primitives);
        Ok(())
    }

    fn schedule_kick_inner(
        &mut self,
        surface_id: SurfaceId,
        flags: ScheduleFlags,
    ) -> Result<KickOutcome, DriverError> {
        self.surface_or_err(surface_id)?;
        self.flush_other_surface(surface_id)?;
        let outcome = self.submit(surface_id, flags)?;

        if outcome == KickOutcome::Skipped && flags.contains(ScheduleFlags::END_EXTERNAL_FRAME) {
            self.surface_mut_or_err(surface_id)?.end_external_frame();
        }
        if flags.contains(ScheduleFlags::FINISH) {
            self.wait_for_render_inner(surface_id)?;
        }
        self.reclaim_retired();
        Ok(outcome)
    }

    fn overflow_kick(
        &mut self,
        surface_id: SurfaceId,
        class: RingClass,
    ) -> Result<(), DriverError> {
        debug!(
            surface = surface_id,
            %class,
            "ring reached single-kick capacity; forcing overflow kick"
        );
        self.submit(surface_id, ScheduleFlags::RING_OVERFLOW)?;
        Ok(())
    }

    fn wait_for_command_stream_inner(&mut self, surface_id: SurfaceId) -> Result<(), DriverError> {
        self.surface_or_err(surface_id)?;
        for class in RingClass::ALL {
            let counter = self.rings.ring(class).counter().clone();
            let target = counter.next_to_signal();
            self.waiter
                .wait(&counter, target, WaitKind::CommandStream)
                .map_err(|error| DriverError::from_wait(surface_id, error))?;
        }
        self.reclaim_retired();
        Ok(())
    }

    fn wait_for_render_inner(&mut self, surface_id: SurfaceId) -> Result<(), DriverError> {
        let counter = self.surface_or_err(surface_id)?.render_counter().clone();
        let target = counter.next_to_signal();
        self.waiter
            .wait(&counter, target, WaitKind::RenderCompletion)
            .map_err(|error| DriverError::from_wait(surface_id, error))?;
        self.reclaim_retired();
        Ok(())
    }

    fn add_source_dependency_inner(
        &mut self,
        surface_id: SurfaceId,
        source_id: SurfaceId,
    ) -> Result<(), DriverError> {
        self.surface_or_err(surface_id)?;
        if self.surface_or_err(source_id)?.has_unflushed_work() && source_id != surface_id {
            self.flush_other_surface(source_id)?;
            self.submit(source_id, ScheduleFlags::LAST_IN_SCENE)?;
        }

        let counter = self.surface_or_err(source_id)?.render_counter().clone();
        let wait_value = counter.next_to_signal();
        if source_id != surface_id && counter.is_reached(wait_value) {
            return Ok(());
        }
        self.surface_mut_or_err(surface_id)?
            .add_source_dependency(DependencyHandle {
                source: source_id,
                counter,
                wait_value,
            })?;
        Ok(())
    }

    fn resize_surface_inner(
        &mut self,
        surface_id: SurfaceId,
        width: u32,
        height: u32,
    ) -> Result<(), DriverError> {
        let surface = self.surface_mut_or_err(surface_id)?;
        let displaced = surface.resize(width, height)?;
        let counter = surface.render_counter().clone();
        if let Some(buffer) = displaced {
            self.retire_aux_buffer(surface_id, &counter, buffer)?;
        }
        Ok(())
    }

    fn destroy_surface_inner(&mut self, surface_id: SurfaceId) -> Result<(), DriverError> {
        if self.surface_or_err(surface_id)?.scene_state() != SceneState::Idle {
            self.flush_other_surface(surface_id)?;
            self.submit(surface_id, ScheduleFlags::ABORT)?;
        }
        if self.recording_surface == Some(surface_id) {
            self.recording_surface = None;
        }

        let counter = self.surface_or_err(surface_id)?.render_counter().clone();
        let target = counter.next_to_signal();
        let wait = self.waiter.wait(&counter, target, WaitKind::RenderCompletion);

        let Some(mut surface) = self.surfaces.remove(&surface_id) else {
            return Err(DriverError::UnknownSurface {
                surface: surface_id,
            });
        };
        let aux_buffer = surface.take_aux_buffer();
        match wait {
            Ok(()) => {
                if let Some(buffer) = aux_buffer {
                    self.allocator.free(buffer);
                }
            }
            Err(error) => {
                warn!(
                    surface = surface_id,
                    %error,
                    "destroying surface with renders in flight; ghosting its auxiliary buffer"
                );
                if let Some(buffer) = aux_buffer {
                    self.retire_aux_buffer(surface_id, &counter, buffer)?;
                }
            }
        }

        let detach = self.resources.detach_surface(surface_id);
        self.reclaim_retired();
        debug!(
            surface = surface_id,
            unlinked = detach.unlinked,
            still_pending = detach.still_pending.len(),
            "destroyed surface"
        );
        Ok(())
    }

    /// Hand the rings to `surface`, kicking whatever another surface left in them.
    fn flush_other_surface(&mut self, surface_id: SurfaceId) -> Result<(), DriverError> {
        let Some(other) = self.recording_surface else {
            return Ok(());
        };
        if other == surface_id {
            return Ok(());
        }
        if self.rings.has_pending() && self.surfaces.contains_key(&other) {
            debug!(
                surface = other,
                next = surface_id,
                "kicking recorded words before switching surface"
            );
            self.submit(other, ScheduleFlags::empty())?;
        }
        self.recording_surface = None;
        Ok(())
    }

    fn submit(
        &mut self,
        surface_id: SurfaceId,
        flags: ScheduleFlags,
    ) -> Result<KickOutcome, DriverError> {
        let surface = self
            .surfaces
            .get_mut(&surface_id)
            .ok_or(DriverError::UnknownSurface {
                surface: surface_id,
            })?;
        let outcome = self.submitter.submit(
            surface,
            &mut self.rings,
            flags,
            &mut self.state_layer,
            &mut self.allocator,
        )?;
        if outcome != KickOutcome::Skipped && self.recording_surface == Some(surface_id) {
            self.recording_surface = None;
        }
        Ok(outcome)
    }

    /// Append `words` to `class`, kicking once to make room when the ring is full.
    fn write_words(
        &mut self,
        surface_id: SurfaceId,
        class: RingClass,
        words: &[u32],
    ) -> Result<(), DriverError> {
        match self.rings.write_block(class, words) {
            Ok(_) => {}
            Err(source @ RingReserveError::RequestTooLarge { .. }) => {
                return Err(DriverError::BufferSpaceExhausted {
                    surface: surface_id,
                    source,
                });
            }
            Err(first_error) => {
                self.overflow_kick(surface_id, class)?;
                if matches!(first_error, RingReserveError::OutOfSpace { .. }) {
                    let counter = self.rings.ring(class).counter().clone();
                    let target = counter.next_to_signal();
                    self.waiter
                        .wait(&counter, target, WaitKind::CommandStream)
                        .map_err(|error| DriverError::from_wait(surface_id, error))?;
                }
                self.rings.write_block(class, words).map_err(|source| {
                    warn!(surface = surface_id, %source, "ring still full after draining kick");
                    DriverError::BufferSpaceExhausted {
                        surface: surface_id,
                        source,
                    }
                })?;
            }
        }
        self.recording_surface = Some(surface_id);
        Ok(())
    }

    /// Free an auxiliary buffer now, or ghost it until `counter` confirms the last submitted
    /// render.
    fn retire_aux_buffer(
        &mut self,
        surface_id: SurfaceId,
        counter: &CompletionCounter,
        buffer: DeviceAllocation,
    ) -> Result<(), DriverError> {
        let target = counter.next_to_signal();
        if counter.is_reached(target) {
            self.allocator.free(buffer);
            return Ok(());
        }
        let key = self.resources.track_unnamed(ResourceKind::DepthStencilBuffer);
        self.resources.register_use(surface_id, key, counter, target)?;
        match self.resources.ghost_unnamed(key, buffer) {
            Ok(GhostOutcome::FreeNow(buffer)) => self.allocator.free(buffer),
            Ok(GhostOutcome::Ghosted) => {
                debug!(
                    surface = surface_id,
                    target,
                    "auxiliary buffer ghosted until render retires"
                );
            }
            Err(GhostError { reason, .. }) => return Err(reason.into()),
        }
        Ok(())
    }

    fn surface_or_err(&self, surface: SurfaceId) -> Result<&RenderSurface, DriverError> {
        self.surfaces
            .get(&surface)
            .ok_or(DriverError::UnknownSurface { surface })
    }

    fn surface_mut_or_err(
        &mut self,
        surface: SurfaceId,
    ) -> Result<&mut RenderSurface, DriverError> {
        self.surfaces
            .get_mut(&surface)
            .ok_or(DriverError::UnknownSurface { surface })
    }

    fn latched<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(error) = &result
            && self.api_error.is_none()
        {
            self.api_error = Some(error.api_error());
        }
        result
    }
}

/// Lets a resource wait render the scenes that still reference the resource. Each kick is a
/// partial render, so the scene stays open.
struct PartialRenderKicker<'a, K, L, A> {
    context: &'a mut DriverContext<K, L, A>,
}

impl<K, L, A> ForceKick for PartialRenderKicker<'_, K, L, A>
where
    K: KernelServices,
    L: FixedFunctionStateLayer,
    A: DeviceAllocator,
{
    fn has_unflushed_work(&self, surface: SurfaceId) -> bool {
        self.context
            .surfaces
            .get(&surface)
            .is_some_and(RenderSurface::has_unflushed_work)
            || self.context.state_layer.pending_primitives(surface) > 0
    }

    fn force_kick(&mut self, surface: SurfaceId) -> bool {
        self.context
            .schedule_kick(
                surface,
                ScheduleFlags::FORCE | ScheduleFlags::PARTIAL_RENDER,
            )
            .is_ok()
    }
}

impl<K, L, A> std::fmt::Debug for DriverContext<K, L, A> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DriverContext")
            .field("surfaces", &self.surfaces.len())
            .field("recording_surface", &self.recording_surface)
            .field("rings", &self.rings)
            .field("api_error", &self.api_error)
            .finish()
    }
}
