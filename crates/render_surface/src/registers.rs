use kick_protocol::{
    IspRegisters, MteRegisters, PixelBackendRegisters, RegionClip, RegisterDirty,
    RegisterSnapshot, Viewport,
};

/// Fixed-function register blocks of one surface.
///
/// `pending` is what the next scene will run with. A dirty bit is set while a field differs from
/// what the hardware last received, so setting a field back to its submitted value clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCache {
    pending: RegisterSnapshot,
    last_submitted: Option<RegisterSnapshot>,
    dirty: RegisterDirty,
}

impl RegisterCache {
    pub fn new(pending: RegisterSnapshot) -> Self {
        Self {
            pending,
            last_submitted: None,
            dirty: RegisterDirty::all(),
        }
    }

    pub fn pending(&self) -> &RegisterSnapshot {
        &self.pending
    }

    pub fn last_submitted(&self) -> Option<&RegisterSnapshot> {
        self.last_submitted.as_ref()
    }

    pub fn dirty(&self) -> RegisterDirty {
        self.dirty
    }

    pub fn set_isp_control(&mut self, control: u32) -> bool {
        self.update(RegisterDirty::ISP_CONTROL, |snapshot| &mut snapshot.isp.control, control)
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        self.update(RegisterDirty::VIEWPORT, |snapshot| &mut snapshot.isp.viewport, viewport)
    }

    pub fn set_region_clip(&mut self, region_clip: RegionClip) -> bool {
        self.update(
            RegisterDirty::REGION_CLIP,
            |snapshot| &mut snapshot.isp.region_clip,
            region_clip,
        )
    }

    pub fn set_mte(&mut self, mte: MteRegisters) -> bool {
        self.update(RegisterDirty::MTE, |snapshot| &mut snapshot.mte, mte)
    }

    pub fn set_pixel_backend(&mut self, pixel_backend: PixelBackendRegisters) -> bool {
        self.update(
            RegisterDirty::PIXEL_BACKEND,
            |snapshot| &mut snapshot.pixel_backend,
            pixel_backend,
        )
    }

    pub fn isp(&self) -> IspRegisters {
        self.pending.isp
    }

    /// The hardware now runs with `snapshot`.
    pub fn mark_submitted(&mut self, snapshot: RegisterSnapshot) {
        self.last_submitted = Some(snapshot);
        self.dirty = RegisterDirty::empty();
    }

    /// A closed scene leaves nothing on the hardware to diff against.
    pub fn reset_for_new_scene(&mut self) {
        self.last_submitted = None;
        self.dirty = RegisterDirty::all();
    }

    fn update<T: PartialEq + Copy>(
        &mut self,
        bit: RegisterDirty,
        field: impl Fn(&mut RegisterSnapshot) -> &mut T,
        value: T,
    ) -> bool {
        let slot = field(&mut self.pending);
        if *slot == value {
            return false;
        }
        *slot = value;

        let matches_hardware = self
            .last_submitted
            .as_mut()
            .is_some_and(|submitted| *field(submitted) == value);
        self.dirty.set(bit, !matches_hardware);
        true
    }
}
