use command_ring::{RingReserveError, RingSet};
use kick_protocol::{
    CompletionCounter, CounterTarget, CounterUpdate, DepthStencilOps, DeviceAllocation,
    HardwareAddress, KickDescriptor, KickFlags, MAX_COUNTER_UPDATES, RingClass, RingRange,
    ScheduleFlags, SurfaceId,
};
use render_surface::{CommittedKick, RenderSurface, SceneState};
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::{
    DeviceAllocator, FixedFunctionStateLayer, KernelServices, KickError, KickOutcome,
    SubmittedKick,
};

/// A speculative `next_to_signal` bump, undone if the kernel refuses the kick.
#[derive(Debug)]
struct CounterReservation {
    counter: CompletionCounter,
    previous: u32,
}

#[derive(Debug, Default)]
struct DepthStencilPlan {
    ops: DepthStencilOps,
    buffer: Option<HardwareAddress>,
    new_aux: Option<DeviceAllocation>,
}

/// Builds and submits kicks. The surface and rings only change after the kernel accepted one.
#[derive(Debug)]
pub struct KickSubmitter<K> {
    kernel: K,
    submitted_kicks: u64,
}

impl<K: KernelServices> KickSubmitter<K> {
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            submitted_kicks: 0,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn submitted_kicks(&self) -> u64 {
        self.submitted_kicks
    }

    pub fn submit(
        &mut self,
        surface: &mut RenderSurface,
        rings: &mut RingSet,
        flags: ScheduleFlags,
        state_layer: &mut dyn FixedFunctionStateLayer,
        aux: &mut dyn DeviceAllocator,
    ) -> Result<KickOutcome, KickError> {
        let surface_id = surface.id();
        let state = surface.scene_state();
        if state == SceneState::Idle && !flags.contains(ScheduleFlags::FORCE) {
            trace!(surface = surface_id, ?flags, "no scene open; nothing to kick");
            return Ok(KickOutcome::Skipped);
        }
        if flags.contains(ScheduleFlags::ABORT) {
            match state {
                SceneState::Idle => return Ok(KickOutcome::Skipped),
                SceneState::Recording => {
                    rings.discard_pending();
                    surface.discard_scene();
                    return Ok(KickOutcome::DiscardedLocally);
                }
                SceneState::SceneOpen { .. } => {}
            }
        }

        let kick_flags = kick_flags_for(surface, flags);
        let first = kick_flags.contains(KickFlags::FIRST_IN_SCENE);
        let closes_scene = kick_flags.intersects(KickFlags::LAST_IN_SCENE | KickFlags::ABORT);
        let signals_render = closes_scene || flags.contains(ScheduleFlags::PARTIAL_RENDER);

        // Words written for this kick only are dropped again if it does not go out.
        let ring_marks = rings.marks();
        let mut copy_program = None;
        if first {
            let dirty = surface.registers().dirty() | state_layer.dirty_registers(surface_id);
            copy_program = match state_layer.regenerate_register_programs(
                surface_id,
                surface.registers().pending(),
                dirty,
                rings,
            ) {
                Ok(address) => address,
                Err(source) => {
                    rings.rewind_to(&ring_marks);
                    return Err(buffer_space_exhausted(surface_id, source));
                }
            };
        }

        let pending_ranges: SmallVec<[RingRange; RingClass::COUNT]> = RingClass::ALL
            .iter()
            .filter_map(|class| rings.ring(*class).pending_range())
            .collect();
        let updates = pending_ranges.len() + usize::from(signals_render);
        if updates > MAX_COUNTER_UPDATES {
            rings.rewind_to(&ring_marks);
            return Err(KickError::CounterUpdateListFull {
                surface: surface_id,
                updates,
            });
        }

        let depth_stencil = plan_depth_stencil(surface, kick_flags, aux);

        let mut descriptor = KickDescriptor::new(surface_id, kick_flags);
        descriptor.depth_stencil_buffer = depth_stencil.buffer;
        descriptor.dependencies = surface.source_dependencies().iter().cloned().collect();
        if first || depth_stencil.ops != DepthStencilOps::NONE {
            let mut snapshot = *surface.registers().pending();
            snapshot.copy_program = copy_program;
            snapshot.pixel_backend.depth_stencil_ops = depth_stencil.ops;
            snapshot.pixel_backend.depth_stencil_buffer = depth_stencil.buffer;
            descriptor.registers = Some(snapshot);
        }

        let mut reservations: SmallVec<[CounterReservation; MAX_COUNTER_UPDATES]> =
            SmallVec::new();
        for range in &pending_ranges {
            let counter = rings.ring(range.class).counter();
            let value = reserve_counter(counter, &mut reservations);
            descriptor.ring_ranges.push(*range);
            descriptor.counter_updates.push(CounterUpdate {
                target: CounterTarget::Ring(range.class),
                counter: counter.clone(),
                value,
            });
        }
        let render_value = signals_render.then(|| {
            let counter = surface.render_counter();
            let value = reserve_counter(counter, &mut reservations);
            descriptor.counter_updates.push(CounterUpdate {
                target: CounterTarget::RenderCompletion,
                counter: counter.clone(),
                value,
            });
            value
        });

        if let Err(source) = self.kernel.submit_kick(&descriptor) {
            rollback_counters(&reservations);
            rings.rewind_to(&ring_marks);
            if let Some(buffer) = depth_stencil.new_aux {
                aux.free(buffer);
            }
            error!(
                surface = surface_id,
                flags = ?kick_flags,
                %source,
                "kernel refused kick; counters and ring words rolled back"
            );
            return Err(KickError::KickSubmissionFailed {
                surface: surface_id,
                source,
            });
        }

        let mut ring_values = SmallVec::new();
        for update in &descriptor.counter_updates {
            let CounterTarget::Ring(class) = update.target else {
                continue;
            };
            if let Some(range) = descriptor
                .ring_ranges
                .iter()
                .find(|range| range.class == class)
            {
                rings.ring_mut(class).mark_submitted(*range, update.value);
                ring_values.push((class, update.value));
            }
        }
        if let Some(buffer) = depth_stencil.new_aux {
            surface.attach_aux_buffer(buffer);
        }
        let committed_registers = first.then(|| *surface.registers().pending());
        surface.commit_kick(&CommittedKick {
            flags: kick_flags,
            registers: committed_registers,
            dependencies_consumed: descriptor.dependencies.len(),
            ends_external_frame: flags.contains(ScheduleFlags::END_EXTERNAL_FRAME),
        });
        self.submitted_kicks += 1;

        debug!(
            surface = surface_id,
            flags = ?kick_flags,
            rings = descriptor.ring_ranges.len(),
            render_value,
            "submitted kick"
        );
        Ok(KickOutcome::Submitted(SubmittedKick {
            flags: kick_flags,
            render_value,
            ring_values,
        }))
    }
}

fn kick_flags_for(surface: &RenderSurface, flags: ScheduleFlags) -> KickFlags {
    let state = surface.scene_state();
    let first = !matches!(state, SceneState::SceneOpen { .. });
    let abort = flags.contains(ScheduleFlags::ABORT);
    // A forced kick with no scene open is a scene of its own.
    let closes = state == SceneState::Idle
        || flags.intersects(
            ScheduleFlags::LAST_IN_SCENE
                | ScheduleFlags::FINISH
                | ScheduleFlags::END_EXTERNAL_FRAME,
        );

    let mut kick_flags = KickFlags::empty();
    if first {
        kick_flags |= KickFlags::FIRST_IN_SCENE;
    }
    if flags.contains(ScheduleFlags::RESET_PIPELINE) || (first && surface.reset_pipeline_pending())
    {
        kick_flags |= KickFlags::RESET_PIPELINE;
    }
    if flags.contains(ScheduleFlags::FLUSH_CACHES) {
        kick_flags |= KickFlags::FLUSH_CACHES;
    }
    if abort {
        kick_flags |= KickFlags::ABORT;
    } else if closes {
        kick_flags |= KickFlags::LAST_IN_SCENE;
    } else if flags.intersects(ScheduleFlags::RING_OVERFLOW | ScheduleFlags::PARTIAL_RENDER) {
        kick_flags |= KickFlags::MID_SCENE_OVERFLOW;
    }
    if (abort || closes) && surface.is_overflowing() {
        kick_flags |= KickFlags::OVERFLOW_RETIRED;
    }
    kick_flags
}

/// Overflow kicks store depth/stencil to the auxiliary buffer and the kick after one loads it back.
fn plan_depth_stencil(
    surface: &RenderSurface,
    kick_flags: KickFlags,
    aux: &mut dyn DeviceAllocator,
) -> DepthStencilPlan {
    let attachments = surface.attachments();
    let loads = surface.aux_holds_scene_data() && !kick_flags.contains(KickFlags::ABORT);
    let stores = kick_flags.contains(KickFlags::MID_SCENE_OVERFLOW);
    if !attachments.any() || !(loads || stores) {
        return DepthStencilPlan::default();
    }

    let mut new_aux = None;
    let buffer = match surface.aux_buffer() {
        Some(buffer) => buffer,
        None => {
            let bytes = surface.aux_buffer_bytes();
            let Some(buffer) = aux.allocate(bytes) else {
                warn!(
                    surface = surface.id(),
                    bytes,
                    "no aux depth/stencil buffer; kick skips depth/stencil load and store"
                );
                return DepthStencilPlan::default();
            };
            new_aux = Some(buffer);
            buffer
        }
    };

    DepthStencilPlan {
        ops: DepthStencilOps {
            depth_load: loads && attachments.depth,
            depth_store: stores && attachments.depth,
            stencil_load: loads && attachments.stencil,
            stencil_store: stores && attachments.stencil,
        },
        buffer: Some(buffer.address),
        new_aux,
    }
}

fn reserve_counter(
    counter: &CompletionCounter,
    reservations: &mut SmallVec<[CounterReservation; MAX_COUNTER_UPDATES]>,
) -> u32 {
    let previous = counter.next_to_signal();
    let value = counter.reserve_next();
    reservations.push(CounterReservation {
        counter: counter.clone(),
        previous,
    });
    value
}

fn rollback_counters(reservations: &[CounterReservation]) {
    for reservation in reservations.iter().rev() {
        reservation
            .counter
            .restore_next_to_signal(reservation.previous);
    }
}

fn buffer_space_exhausted(surface: SurfaceId, source: RingReserveError) -> KickError {
    warn!(surface, %source, "no ring space for register copy program");
    KickError::BufferSpaceExhausted { surface, source }
}
