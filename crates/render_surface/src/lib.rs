//! Per-surface scene state: whether a scene is open on the hardware, what the next kick must
//! carry, and the register blocks that go with it.

mod registers;

pub use registers::RegisterCache;

use kick_protocol::{
    ClearFlags, CompletionCounter, DependencyHandle, DeviceAllocation, KickFlags,
    MAX_SOURCE_DEPENDENCIES, MteRegisters, PixelBackendRegisters, RegisterSnapshot, SurfaceId,
    align_to_tiles,
};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Depth (32-bit float) plus stencil (8-bit) per pixel in the auxiliary buffer.
pub const AUX_BYTES_PER_PIXEL: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneState {
    Idle,
    /// Opened by `prepare_to_draw`; nothing has reached the hardware yet.
    Recording,
    /// A first-in-scene kick was submitted. `overflowing` once a ring forced a mid-scene kick.
    SceneOpen { overflowing: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthStencilAttachments {
    pub depth: bool,
    pub stencil: bool,
}

impl DepthStencilAttachments {
    pub fn any(self) -> bool {
        self.depth || self.stencil
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDescriptor {
    pub width: u32,
    pub height: u32,
    pub color_format: u32,
    pub attachments: DepthStencilAttachments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("surface {surface} cannot change while a hardware scene is open")]
    SceneOpen { surface: SurfaceId },
    #[error("surface {surface} already waits on {capacity} source renders")]
    DependencyListFull { surface: SurfaceId, capacity: usize },
    #[error("surface {surface} cannot depend on its own render")]
    SelfDependency { surface: SurfaceId },
    #[error("surface {surface} cannot have a zero-sized dimension")]
    ZeroSize { surface: SurfaceId },
}

/// Effects of a kick the kernel accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedKick {
    pub flags: KickFlags,
    /// Register state the hardware now runs with, when the kick carried registers.
    pub registers: Option<RegisterSnapshot>,
    pub dependencies_consumed: usize,
    pub ends_external_frame: bool,
}

#[derive(Debug)]
pub struct RenderSurface {
    id: SurfaceId,
    width: u32,
    height: u32,
    attachments: DepthStencilAttachments,
    state: SceneState,
    in_external_frame: bool,
    primitives_since_last_kick: u32,
    render_counter: CompletionCounter,
    source_dependencies: SmallVec<[DependencyHandle; MAX_SOURCE_DEPENDENCIES]>,
    aux_buffer: Option<DeviceAllocation>,
    aux_holds_scene_data: bool,
    reset_pipeline_pending: bool,
    pending_clear: ClearFlags,
    registers: RegisterCache,
}

impl RenderSurface {
    pub fn new(id: SurfaceId, descriptor: SurfaceDescriptor) -> Result<Self, SurfaceError> {
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(SurfaceError::ZeroSize { surface: id });
        }
        let registers = RegisterSnapshot {
            mte: MteRegisters {
                control: 0,
                screen_width: descriptor.width,
                screen_height: descriptor.height,
            },
            pixel_backend: PixelBackendRegisters {
                width: descriptor.width,
                height: descriptor.height,
                color_format: descriptor.color_format,
                ..PixelBackendRegisters::default()
            },
            ..RegisterSnapshot::default()
        };
        Ok(Self {
            id,
            width: descriptor.width,
            height: descriptor.height,
            attachments: descriptor.attachments,
            state: SceneState::Idle,
            in_external_frame: false,
            primitives_since_last_kick: 0,
            render_counter: CompletionCounter::new(),
            source_dependencies: SmallVec::new(),
            aux_buffer: None,
            aux_holds_scene_data: false,
            reset_pipeline_pending: false,
            pending_clear: ClearFlags::empty(),
            registers: RegisterCache::new(registers),
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn attachments(&self) -> DepthStencilAttachments {
        self.attachments
    }

    pub fn scene_state(&self) -> SceneState {
        self.state
    }

    /// A scene is open on the hardware.
    pub fn in_frame(&self) -> bool {
        matches!(self.state, SceneState::SceneOpen { .. })
    }

    /// The next kick opens the hardware scene.
    pub fn first_kick(&self) -> bool {
        !self.in_frame()
    }

    pub fn is_overflowing(&self) -> bool {
        matches!(self.state, SceneState::SceneOpen { overflowing: true })
    }

    pub fn in_external_frame(&self) -> bool {
        self.in_external_frame
    }

    /// Recorded work that has not been closed out by a last-in-scene kick.
    pub fn has_unflushed_work(&self) -> bool {
        self.state != SceneState::Idle || self.primitives_since_last_kick > 0
    }

    pub fn primitives_since_last_kick(&self) -> u32 {
        self.primitives_since_last_kick
    }

    pub fn render_counter(&self) -> &CompletionCounter {
        &self.render_counter
    }

    pub fn source_dependencies(&self) -> &[DependencyHandle] {
        &self.source_dependencies
    }

    pub fn aux_buffer(&self) -> Option<DeviceAllocation> {
        self.aux_buffer
    }

    /// The previous kick stored depth/stencil into the auxiliary buffer.
    pub fn aux_holds_scene_data(&self) -> bool {
        self.aux_holds_scene_data
    }

    pub fn reset_pipeline_pending(&self) -> bool {
        self.reset_pipeline_pending
    }

    pub fn pending_clear(&self) -> ClearFlags {
        self.pending_clear
    }

    pub fn registers(&self) -> &RegisterCache {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterCache {
        &mut self.registers
    }

    /// Open a software scene if none is open. Returns `true` when this call opened it.
    pub fn open_scene(&mut self) -> bool {
        self.in_external_frame = true;
        if self.state != SceneState::Idle {
            return false;
        }
        self.state = SceneState::Recording;
        trace!(surface = self.id, "opened scene");
        true
    }

    /// The display surface finished its frame without a kick being needed.
    pub fn end_external_frame(&mut self) {
        self.in_external_frame = false;
    }

    pub fn request_clear(&mut self, flags: ClearFlags) {
        self.pending_clear |= flags;
    }

    pub fn take_pending_clear(&mut self) -> ClearFlags {
        std::mem::take(&mut self.pending_clear)
    }

    pub fn record_primitives(&mut self, count: u32) {
        self.primitives_since_last_kick = self.primitives_since_last_kick.saturating_add(count);
    }

    /// Make the next kick wait on another surface's render. A newer handle for the same source
    /// replaces the older one.
    pub fn add_source_dependency(
        &mut self,
        dependency: DependencyHandle,
    ) -> Result<(), SurfaceError> {
        if dependency.source == self.id {
            return Err(SurfaceError::SelfDependency { surface: self.id });
        }
        if let Some(existing) = self
            .source_dependencies
            .iter_mut()
            .find(|existing| existing.source == dependency.source)
        {
            *existing = dependency;
            return Ok(());
        }
        if self.source_dependencies.len() == MAX_SOURCE_DEPENDENCIES {
            return Err(SurfaceError::DependencyListFull {
                surface: self.id,
                capacity: MAX_SOURCE_DEPENDENCIES,
            });
        }
        self.source_dependencies.push(dependency);
        Ok(())
    }

    /// Bytes an auxiliary depth/stencil buffer needs for the current pixel back-end size.
    pub fn aux_buffer_bytes(&self) -> u64 {
        let pixel_backend = self.registers.pending().pixel_backend;
        u64::from(align_to_tiles(pixel_backend.width))
            * u64::from(align_to_tiles(pixel_backend.height))
            * AUX_BYTES_PER_PIXEL
    }

    pub fn attach_aux_buffer(&mut self, buffer: DeviceAllocation) {
        assert!(
            self.aux_buffer.is_none(),
            "surface {} already owns an auxiliary buffer",
            self.id
        );
        self.aux_buffer = Some(buffer);
    }

    pub fn take_aux_buffer(&mut self) -> Option<DeviceAllocation> {
        self.aux_holds_scene_data = false;
        self.aux_buffer.take()
    }

    /// Change the surface size. The auxiliary buffer no longer fits and is handed back.
    pub fn resize(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<Option<DeviceAllocation>, SurfaceError> {
        if self.in_frame() {
            return Err(SurfaceError::SceneOpen { surface: self.id });
        }
        if width == 0 || height == 0 {
            return Err(SurfaceError::ZeroSize { surface: self.id });
        }
        if (width, height) == (self.width, self.height) {
            return Ok(None);
        }
        self.width = width;
        self.height = height;

        let mut pixel_backend = self.registers.pending().pixel_backend;
        pixel_backend.width = width;
        pixel_backend.height = height;
        self.registers.set_pixel_backend(pixel_backend);
        let mut mte = self.registers.pending().mte;
        mte.screen_width = width;
        mte.screen_height = height;
        self.registers.set_mte(mte);

        debug!(surface = self.id, width, height, "resized surface");
        Ok(self.take_aux_buffer())
    }

    /// Drop a scene that never reached the hardware.
    pub fn discard_scene(&mut self) {
        assert_eq!(
            self.state,
            SceneState::Recording,
            "surface {} can only discard a scene still recording",
            self.id
        );
        self.state = SceneState::Idle;
        self.primitives_since_last_kick = 0;
        self.pending_clear = ClearFlags::empty();
        self.source_dependencies.clear();
        self.reset_pipeline_pending = true;
        debug!(surface = self.id, "discarded unsubmitted scene");
    }

    /// Apply a kick the kernel accepted.
    pub fn commit_kick(&mut self, kick: &CommittedKick) {
        self.primitives_since_last_kick = 0;
        self.source_dependencies.drain(..kick.dependencies_consumed);
        if let Some(snapshot) = kick.registers {
            self.registers.mark_submitted(snapshot);
        }
        if kick.flags.contains(KickFlags::RESET_PIPELINE) {
            self.reset_pipeline_pending = false;
        }
        if kick.ends_external_frame {
            self.in_external_frame = false;
        }

        let overflow = kick.flags.contains(KickFlags::MID_SCENE_OVERFLOW);
        self.aux_holds_scene_data = overflow && self.aux_buffer.is_some();

        let closes = kick
            .flags
            .intersects(KickFlags::LAST_IN_SCENE | KickFlags::ABORT);
        self.state = if closes {
            self.registers.reset_for_new_scene();
            if kick.flags.contains(KickFlags::ABORT) {
                self.reset_pipeline_pending = true;
            }
            SceneState::Idle
        } else {
            let overflowing = self.is_overflowing() || overflow;
            SceneState::SceneOpen { overflowing }
        };
        trace!(surface = self.id, flags = ?kick.flags, state = ?self.state, "committed kick");
    }
}
