mod counter;

pub use counter::{CompletionCounter, counter_reached};

use std::fmt;

use bitflags::bitflags;
use smallvec::SmallVec;

pub type SurfaceId = u64;
pub type HardwareAddress = u64;

/// Hardware limit on completion-counter writes carried by one kick.
pub const MAX_COUNTER_UPDATES: usize = 6;
pub const MAX_SOURCE_DEPENDENCIES: usize = 8;
pub const TILE_GRANULARITY_PIXELS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RingClass {
    VertexData,
    IndexData,
    ShaderState,
    ControlStream,
}

impl RingClass {
    pub const COUNT: usize = 4;
    pub const ALL: [RingClass; RingClass::COUNT] = [
        RingClass::VertexData,
        RingClass::IndexData,
        RingClass::ShaderState,
        RingClass::ControlStream,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn label(self) -> &'static str {
        match self {
            RingClass::VertexData => "vertex-data",
            RingClass::IndexData => "index-data",
            RingClass::ShaderState => "shader-state",
            RingClass::ControlStream => "control-stream",
        }
    }
}

impl fmt::Display for RingClass {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

// One update per ring class plus the render counter must always fit.
static_assertions::const_assert!(RingClass::COUNT + 1 <= MAX_COUNTER_UPDATES);

bitflags! {
    /// Flags carried by the hardware kick descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KickFlags: u32 {
        const FIRST_IN_SCENE = 1 << 0;
        const LAST_IN_SCENE = 1 << 1;
        const ABORT = 1 << 2;
        const MID_SCENE_OVERFLOW = 1 << 3;
        const OVERFLOW_RETIRED = 1 << 4;
        const RESET_PIPELINE = 1 << 5;
        const FLUSH_CACHES = 1 << 6;
    }
}

bitflags! {
    /// What a caller of `schedule_kick` asks for. The assembler turns these into [`KickFlags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ScheduleFlags: u32 {
        /// Kick even when the surface has no scene open.
        const FORCE = 1 << 0;
        const LAST_IN_SCENE = 1 << 1;
        const ABORT = 1 << 2;
        /// A ring reported that one kick's worth of data filled it.
        const RING_OVERFLOW = 1 << 3;
        const FLUSH_CACHES = 1 << 4;
        const RESET_PIPELINE = 1 << 5;
        /// Block until the kick's render completion is confirmed.
        const FINISH = 1 << 6;
        /// The display surface's frame ends with this kick.
        const END_EXTERNAL_FRAME = 1 << 7;
        /// Render what the scene holds so far and confirm it on the render counter. The scene
        /// stays open.
        const PARTIAL_RENDER = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

bitflags! {
    /// Fixed-function register fields changed since they were last sent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegisterDirty: u32 {
        const ISP_CONTROL = 1 << 0;
        const VIEWPORT = 1 << 1;
        const REGION_CLIP = 1 << 2;
        const MTE = 1 << 3;
        const PIXEL_BACKEND = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionClip {
    pub min_tile_x: u32,
    pub min_tile_y: u32,
    pub max_tile_x: u32,
    pub max_tile_y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IspRegisters {
    pub control: u32,
    pub viewport: Viewport,
    pub region_clip: RegionClip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MteRegisters {
    pub control: u32,
    pub screen_width: u32,
    pub screen_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthStencilOps {
    pub depth_load: bool,
    pub depth_store: bool,
    pub stencil_load: bool,
    pub stencil_store: bool,
}

impl DepthStencilOps {
    pub const NONE: DepthStencilOps = DepthStencilOps {
        depth_load: false,
        depth_store: false,
        stencil_load: false,
        stencil_store: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelBackendRegisters {
    pub width: u32,
    pub height: u32,
    pub color_format: u32,
    pub depth_stencil_ops: DepthStencilOps,
    pub depth_stencil_buffer: Option<HardwareAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSnapshot {
    pub isp: IspRegisters,
    pub mte: MteRegisters,
    pub pixel_backend: PixelBackendRegisters,
    /// Hardware address of the regenerated register copy program, when one was written.
    pub copy_program: Option<HardwareAddress>,
}

/// Device memory owned by the driver: an auxiliary buffer or the backing store of an API object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAllocation {
    pub address: HardwareAddress,
    pub bytes: u64,
}

/// A render this kick must wait on: another surface's counter reaching `wait_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyHandle {
    pub source: SurfaceId,
    pub counter: CompletionCounter,
    pub wait_value: u32,
}

/// Ring words `[start, end)` handed to the hardware by one kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRange {
    pub class: RingClass,
    pub start: u32,
    pub end: u32,
    pub start_address: HardwareAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterTarget {
    Ring(RingClass),
    RenderCompletion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub target: CounterTarget,
    pub counter: CompletionCounter,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickDescriptor {
    pub surface: SurfaceId,
    pub flags: KickFlags,
    pub ring_ranges: SmallVec<[RingRange; RingClass::COUNT]>,
    pub registers: Option<RegisterSnapshot>,
    pub counter_updates: SmallVec<[CounterUpdate; MAX_COUNTER_UPDATES]>,
    pub dependencies: SmallVec<[DependencyHandle; MAX_SOURCE_DEPENDENCIES]>,
    pub depth_stencil_buffer: Option<HardwareAddress>,
}

impl KickDescriptor {
    pub fn new(surface: SurfaceId, flags: KickFlags) -> Self {
        Self {
            surface,
            flags,
            ring_ranges: SmallVec::new(),
            registers: None,
            counter_updates: SmallVec::new(),
            dependencies: SmallVec::new(),
            depth_stencil_buffer: None,
        }
    }

    pub fn closes_scene(&self) -> bool {
        self.flags
            .intersects(KickFlags::LAST_IN_SCENE | KickFlags::ABORT)
    }

    pub fn render_update(&self) -> Option<&CounterUpdate> {
        self.counter_updates
            .iter()
            .find(|update| update.target == CounterTarget::RenderCompletion)
    }

    pub fn ring_update(&self, class: RingClass) -> Option<&CounterUpdate> {
        self.counter_updates
            .iter()
            .find(|update| update.target == CounterTarget::Ring(class))
    }
}

/// Round `pixels` up to the tiling granularity.
pub fn align_to_tiles(pixels: u32) -> u32 {
    pixels.div_ceil(TILE_GRANULARITY_PIXELS) * TILE_GRANULARITY_PIXELS
}
