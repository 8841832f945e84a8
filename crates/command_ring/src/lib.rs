mod software;

pub use software::SoftwareRing;

use kick_protocol::{CompletionCounter, HardwareAddress, RingClass, RingRange};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingReserveError {
    #[error("{class} ring cannot hold {words} words in a single kick")]
    RequestTooLarge { class: RingClass, words: u32 },
    #[error("{class} ring reached its single-kick capacity")]
    KickCapacityExceeded { class: RingClass },
    #[error("{class} ring has no free space for {words} words")]
    OutOfSpace { class: RingClass, words: u32 },
}

impl RingReserveError {
    pub fn class(&self) -> RingClass {
        match self {
            RingReserveError::RequestTooLarge { class, .. }
            | RingReserveError::KickCapacityExceeded { class }
            | RingReserveError::OutOfSpace { class, .. } => *class,
        }
    }
}

/// Committed state of a ring at one point, for undoing words written after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingMark {
    pub class: RingClass,
    pub write_offset: u32,
    pub pending_words: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingReservation {
    pub class: RingClass,
    pub offset: u32,
    pub words: u32,
}

/// Append-only command ring for one command class.
///
/// Words move through three stages: reserved, committed (visible to the next kick) and
/// submitted (handed to hardware by a kick, reclaimed once the ring counter confirms it).
pub trait CommandRing: Send {
    fn class(&self) -> RingClass;

    fn reserve(&mut self, words: u32) -> Result<RingReservation, RingReserveError>;

    fn words_mut(&mut self, reservation: &RingReservation) -> &mut [u32];

    /// Commit the first `words` words of the open reservation.
    fn commit(&mut self, words: u32);

    fn hardware_address(&self, offset: u32) -> HardwareAddress;

    /// Committed words not yet handed to a kick.
    fn pending_range(&self) -> Option<RingRange>;

    fn counter(&self) -> &CompletionCounter;

    /// Everything up to `range.end` now belongs to a kick that confirms `counter_value`.
    fn mark_submitted(&mut self, range: RingRange, counter_value: u32);

    /// Drop committed words that were never submitted.
    fn discard_pending(&mut self);

    fn mark(&self) -> RingMark;

    /// Drop the words committed since `mark`. Nothing may have been submitted in between.
    fn rewind_to(&mut self, mark: RingMark);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    pub capacity_words: u32,
    pub max_words_per_kick: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSetConfig {
    pub vertex_data: RingConfig,
    pub index_data: RingConfig,
    pub shader_state: RingConfig,
    pub control_stream: RingConfig,
}

impl RingSetConfig {
    pub fn for_class(&self, class: RingClass) -> RingConfig {
        match class {
            RingClass::VertexData => self.vertex_data,
            RingClass::IndexData => self.index_data,
            RingClass::ShaderState => self.shader_state,
            RingClass::ControlStream => self.control_stream,
        }
    }
}

impl Default for RingSetConfig {
    fn default() -> Self {
        Self {
            vertex_data: RingConfig {
                capacity_words: 256 * 1024,
                max_words_per_kick: 64 * 1024,
            },
            index_data: RingConfig {
                capacity_words: 128 * 1024,
                max_words_per_kick: 32 * 1024,
            },
            shader_state: RingConfig {
                capacity_words: 64 * 1024,
                max_words_per_kick: 16 * 1024,
            },
            control_stream: RingConfig {
                capacity_words: 64 * 1024,
                max_words_per_kick: 16 * 1024,
            },
        }
    }
}

const SOFTWARE_RING_BASE_ADDRESS: HardwareAddress = 0x1000_0000;
const SOFTWARE_RING_ADDRESS_STRIDE: HardwareAddress = 0x0100_0000;

/// One ring per command class, indexed by [`RingClass::index`].
pub struct RingSet {
    rings: Vec<Box<dyn CommandRing>>,
}

impl RingSet {
    pub fn new(rings: Vec<Box<dyn CommandRing>>) -> Self {
        assert_eq!(
            rings.len(),
            RingClass::COUNT,
            "ring set needs exactly one ring per command class"
        );
        for (index, ring) in rings.iter().enumerate() {
            assert_eq!(
                ring.class().index(),
                index,
                "ring set must be ordered by command class"
            );
        }
        Self { rings }
    }

    pub fn software(config: &RingSetConfig) -> Self {
        let rings = RingClass::ALL
            .iter()
            .map(|class| {
                let base_address = SOFTWARE_RING_BASE_ADDRESS
                    + SOFTWARE_RING_ADDRESS_STRIDE * class.index() as HardwareAddress;
                Box::new(SoftwareRing::new(
                    *class,
                    config.for_class(*class),
                    base_address,
                )) as Box<dyn CommandRing>
            })
            .collect();
        Self::new(rings)
    }

    pub fn ring(&self, class: RingClass) -> &dyn CommandRing {
        self.rings[class.index()].as_ref()
    }

    pub fn ring_mut(&mut self, class: RingClass) -> &mut dyn CommandRing {
        self.rings[class.index()].as_mut()
    }

    pub fn has_pending(&self) -> bool {
        self.rings.iter().any(|ring| ring.pending_range().is_some())
    }

    /// Reserve, fill and commit `data` in one go, returning where the hardware will find it.
    pub fn write_block(
        &mut self,
        class: RingClass,
        data: &[u32],
    ) -> Result<HardwareAddress, RingReserveError> {
        let words = u32::try_from(data.len())
            .map_err(|_| RingReserveError::RequestTooLarge { class, words: u32::MAX })?;
        let ring = self.ring_mut(class);
        let reservation = ring.reserve(words)?;
        ring.words_mut(&reservation).copy_from_slice(data);
        ring.commit(words);
        Ok(ring.hardware_address(reservation.offset))
    }

    pub fn discard_pending(&mut self) {
        for ring in &mut self.rings {
            ring.discard_pending();
        }
    }

    pub fn marks(&self) -> [RingMark; RingClass::COUNT] {
        RingClass::ALL.map(|class| self.ring(class).mark())
    }

    pub fn rewind_to(&mut self, marks: &[RingMark; RingClass::COUNT]) {
        for mark in marks {
            self.ring_mut(mark.class).rewind_to(*mark);
        }
    }
}

impl std::fmt::Debug for RingSet {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_list()
            .entries(self.rings.iter().map(|ring| (ring.class(), ring.pending_range())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RingSetConfig {
        let ring = RingConfig {
            capacity_words: 64,
            max_words_per_kick: 32,
        };
        RingSetConfig {
            vertex_data: ring,
            index_data: ring,
            shader_state: ring,
            control_stream: ring,
        }
    }

    #[test]
    fn write_block_commits_and_reports_address() {
        let mut rings = RingSet::software(&small_config());
        assert!(!rings.has_pending());

        let address = rings
            .write_block(RingClass::ShaderState, &[1, 2, 3])
            .expect("write shader state block");

        assert_eq!(
            address,
            rings.ring(RingClass::ShaderState).hardware_address(0)
        );
        let pending = rings
            .ring(RingClass::ShaderState)
            .pending_range()
            .expect("shader state ring has pending words");
        assert_eq!((pending.start, pending.end), (0, 3));
        assert!(rings.has_pending());
        assert!(rings.ring(RingClass::VertexData).pending_range().is_none());
    }

    #[test]
    fn rings_use_distinct_address_windows() {
        let rings = RingSet::software(&small_config());
        let vertex = rings.ring(RingClass::VertexData).hardware_address(0);
        let control = rings.ring(RingClass::ControlStream).hardware_address(0);
        assert_ne!(vertex, control);
    }

    #[test]
    fn discard_pending_clears_every_ring() {
        let mut rings = RingSet::software(&small_config());
        rings
            .write_block(RingClass::VertexData, &[7; 4])
            .expect("write vertex block");
        rings
            .write_block(RingClass::ControlStream, &[9; 2])
            .expect("write control block");

        rings.discard_pending();

        assert!(!rings.has_pending());
    }

    #[test]
    fn rewind_drops_only_words_written_after_the_marks() {
        let mut rings = RingSet::software(&small_config());
        rings
            .write_block(RingClass::VertexData, &[7; 4])
            .expect("write vertex block");
        let marks = rings.marks();
        rings
            .write_block(RingClass::VertexData, &[8; 2])
            .expect("write second vertex block");
        rings
            .write_block(RingClass::ShaderState, &[1; 5])
            .expect("write shader state block");

        rings.rewind_to(&marks);

        let vertex = rings
            .ring(RingClass::VertexData)
            .pending_range()
            .expect("first vertex block survives");
        assert_eq!((vertex.start, vertex.end), (0, 4));
        assert!(rings.ring(RingClass::ShaderState).pending_range().is_none());
        assert_eq!(rings.marks(), marks);
    }

    #[test]
    #[should_panic(expected = "exactly one ring per command class")]
    fn ring_set_rejects_missing_classes() {
        let _ = RingSet::new(Vec::new());
    }
}
