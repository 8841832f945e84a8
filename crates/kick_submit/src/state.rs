use command_ring::{RingReserveError, RingSet};
use kick_protocol::{HardwareAddress, RegisterDirty, RegisterSnapshot, RingClass, SurfaceId};
use smallvec::SmallVec;
use tracing::trace;

/// The drawing-API state layer as seen by kick assembly.
pub trait FixedFunctionStateLayer {
    /// Register blocks the state layer changed behind the surface's back.
    fn dirty_registers(&self, _surface: SurfaceId) -> RegisterDirty {
        RegisterDirty::empty()
    }

    /// Primitives held by the state layer that have not been written to a ring yet.
    fn pending_primitives(&self, _surface: SurfaceId) -> u32 {
        0
    }

    /// Write the register copy program for the dirty blocks and return where it lives.
    fn regenerate_register_programs(
        &mut self,
        surface: SurfaceId,
        registers: &RegisterSnapshot,
        dirty: RegisterDirty,
        rings: &mut RingSet,
    ) -> Result<Option<HardwareAddress>, RingReserveError>;
}

/// State layer with nothing to add; registers travel only in the kick descriptor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateLayer;

impl FixedFunctionStateLayer for NullStateLayer {
    fn regenerate_register_programs(
        &mut self,
        _surface: SurfaceId,
        _registers: &RegisterSnapshot,
        _dirty: RegisterDirty,
        _rings: &mut RingSet,
    ) -> Result<Option<HardwareAddress>, RingReserveError> {
        Ok(None)
    }
}

/// Encodes dirty register blocks as `(block << 16) | len` headers followed by the block words,
/// written into the shader-state ring.
#[derive(Debug, Default, Clone)]
pub struct PackedStateLayer {
    programs_written: u32,
}

impl PackedStateLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn programs_written(&self) -> u32 {
        self.programs_written
    }
}

pub fn encode_register_program(
    registers: &RegisterSnapshot,
    dirty: RegisterDirty,
) -> SmallVec<[u32; 32]> {
    let mut words = SmallVec::new();
    let mut block = |bit: RegisterDirty, body: &[u32]| {
        if dirty.contains(bit) {
            words.push((bit.bits() << 16) | body.len() as u32);
            words.extend_from_slice(body);
        }
    };
    let isp = registers.isp;
    block(RegisterDirty::ISP_CONTROL, &[isp.control]);
    block(
        RegisterDirty::VIEWPORT,
        &[
            isp.viewport.origin_x,
            isp.viewport.origin_y,
            isp.viewport.width,
            isp.viewport.height,
        ],
    );
    block(
        RegisterDirty::REGION_CLIP,
        &[
            isp.region_clip.min_tile_x,
            isp.region_clip.min_tile_y,
            isp.region_clip.max_tile_x,
            isp.region_clip.max_tile_y,
        ],
    );
    let mte = registers.mte;
    block(
        RegisterDirty::MTE,
        &[mte.control, mte.screen_width, mte.screen_height],
    );
    let pixel_backend = registers.pixel_backend;
    block(
        RegisterDirty::PIXEL_BACKEND,
        &[
            pixel_backend.width,
            pixel_backend.height,
            pixel_backend.color_format,
        ],
    );
    words
}

impl FixedFunctionStateLayer for PackedStateLayer {
    fn regenerate_register_programs(
        &mut self,
        surface: SurfaceId,
        registers: &RegisterSnapshot,
        dirty: RegisterDirty,
        rings: &mut RingSet,
    ) -> Result<Option<HardwareAddress>, RingReserveError> {
        if dirty.is_empty() {
            return Ok(None);
        }
        let words = encode_register_program(registers, dirty);
        let address = rings.write_block(RingClass::ShaderState, &words)?;
        self.programs_written += 1;
        trace!(surface, ?dirty, words = words.len(), "wrote register copy program");
        Ok(Some(address))
    }
}

#[cfg(test)]
mod tests {
    use command_ring::RingSetConfig;
    use kick_protocol::Viewport;

    use super::*;

    #[test]
    fn encodes_only_dirty_blocks() {
        let mut registers = RegisterSnapshot::default();
        registers.isp.control = 0x11;
        registers.isp.viewport = Viewport {
            origin_x: 1,
            origin_y: 2,
            width: 3,
            height: 4,
        };

        let words = encode_register_program(
            &registers,
            RegisterDirty::ISP_CONTROL | RegisterDirty::VIEWPORT,
        );

        assert_eq!(
            words.as_slice(),
            &[
                (RegisterDirty::ISP_CONTROL.bits() << 16) | 1,
                0x11,
                (RegisterDirty::VIEWPORT.bits() << 16) | 4,
                1,
                2,
                3,
                4,
            ]
        );
    }

    #[test]
    fn packed_layer_writes_into_shader_state_ring() {
        let mut rings = RingSet::software(&RingSetConfig::default());
        let mut layer = PackedStateLayer::new();

        let address = layer
            .regenerate_register_programs(
                1,
                &RegisterSnapshot::default(),
                RegisterDirty::all(),
                &mut rings,
            )
            .expect("program fits");

        assert_eq!(
            address,
            Some(rings.ring(RingClass::ShaderState).hardware_address(0))
        );
        assert_eq!(layer.programs_written(), 1);
        assert!(rings.ring(RingClass::ShaderState).pending_range().is_some());

        let clean = layer
            .regenerate_register_programs(
                1,
                &RegisterSnapshot::default(),
                RegisterDirty::empty(),
                &mut rings,
            )
            .expect("nothing to write");
        assert_eq!(clean, None);
    }
}
