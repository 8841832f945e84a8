//! Kick assembly: turn a surface's pending ring words, registers and dependencies into one
//! descriptor and hand it to the kernel.

mod state;
mod submitter;

pub use state::{FixedFunctionStateLayer, NullStateLayer, PackedStateLayer, encode_register_program};
pub use submitter::KickSubmitter;

use command_ring::RingReserveError;
use kick_protocol::{
    DeviceAllocation, HardwareAddress, KickDescriptor, KickFlags, RingClass, SurfaceId,
};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("kernel ran out of submission resources")]
    ResourceLimit,
    #[error("device lost")]
    DeviceLost,
    #[error("kernel rejected the kick with status {code}")]
    Rejected { code: i32 },
}

/// Kernel graphics-services submission entry point.
pub trait KernelServices {
    fn submit_kick(&mut self, descriptor: &KickDescriptor) -> Result<(), KernelError>;
}

/// Device memory for auxiliary depth/stencil buffers and API resource storage.
pub trait DeviceAllocator {
    fn allocate(&mut self, bytes: u64) -> Option<DeviceAllocation>;

    fn free(&mut self, allocation: DeviceAllocation);
}

const DEVICE_HEAP_ALIGNMENT: u64 = 4096;

/// Bump allocator over a fixed device address window; freed bytes are only counted.
#[derive(Debug, Clone)]
pub struct DeviceHeap {
    next_address: HardwareAddress,
    end_address: HardwareAddress,
    live_bytes: u64,
    live_allocations: usize,
}

impl DeviceHeap {
    pub fn new(base_address: HardwareAddress, capacity_bytes: u64) -> Self {
        Self {
            next_address: base_address,
            end_address: base_address + capacity_bytes,
            live_bytes: 0,
            live_allocations: 0,
        }
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    pub fn live_allocations(&self) -> usize {
        self.live_allocations
    }
}

impl DeviceAllocator for DeviceHeap {
    fn allocate(&mut self, bytes: u64) -> Option<DeviceAllocation> {
        let address = self.next_address.next_multiple_of(DEVICE_HEAP_ALIGNMENT);
        let end = address.checked_add(bytes)?;
        if end > self.end_address {
            return None;
        }
        self.next_address = end;
        self.live_bytes += bytes;
        self.live_allocations += 1;
        Some(DeviceAllocation { address, bytes })
    }

    fn free(&mut self, allocation: DeviceAllocation) {
        assert!(
            self.live_allocations > 0 && self.live_bytes >= allocation.bytes,
            "device heap freed {:#x} which it never handed out",
            allocation.address
        );
        self.live_bytes -= allocation.bytes;
        self.live_allocations -= 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KickError {
    #[error("surface {surface}: command buffer space exhausted")]
    BufferSpaceExhausted {
        surface: SurfaceId,
        #[source]
        source: RingReserveError,
    },
    #[error("surface {surface}: kick submission failed")]
    KickSubmissionFailed {
        surface: SurfaceId,
        #[source]
        source: KernelError,
    },
    #[error("surface {surface}: {updates} counter updates exceed the hardware limit")]
    CounterUpdateListFull { surface: SurfaceId, updates: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedKick {
    pub flags: KickFlags,
    /// Render counter value the kick confirms when it closes the scene or renders part of it.
    pub render_value: Option<u32>,
    pub ring_values: SmallVec<[(RingClass, u32); RingClass::COUNT]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KickOutcome {
    /// No scene was open and the caller did not force a kick.
    Skipped,
    /// An abort of a scene that never reached the hardware.
    DiscardedLocally,
    Submitted(SubmittedKick),
}

impl KickOutcome {
    pub fn submitted(&self) -> Option<&SubmittedKick> {
        match self {
            KickOutcome::Submitted(kick) => Some(kick),
            KickOutcome::Skipped | KickOutcome::DiscardedLocally => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_heap_aligns_and_runs_out() {
        let mut heap = DeviceHeap::new(0x10_0000, 3 * DEVICE_HEAP_ALIGNMENT);

        let first = heap.allocate(100).expect("first allocation fits");
        let second = heap.allocate(100).expect("second allocation fits");

        assert_eq!(first.address, 0x10_0000);
        assert_eq!(second.address, 0x10_0000 + DEVICE_HEAP_ALIGNMENT);
        assert!(heap.allocate(2 * DEVICE_HEAP_ALIGNMENT).is_none());

        heap.free(first);
        assert_eq!(heap.live_bytes(), 100);
        assert_eq!(heap.live_allocations(), 1);
    }
}
