//! In-process kernel graphics services: a recording kernel retired by hand and a simulated GPU
//! thread. Both confirm kicks by writing their counter updates and raising the kernel event.

mod threaded;

pub use threaded::ThreadedKernel;

use std::collections::VecDeque;

use completion_waiter::KernelEvent;
use kick_protocol::KickDescriptor;
use kick_submit::{KernelError, KernelServices};
use tracing::trace;

/// Whether every render the kick waits on has been confirmed.
pub fn dependencies_met(descriptor: &KickDescriptor) -> bool {
    descriptor
        .dependencies
        .iter()
        .all(|dependency| dependency.counter.is_reached(dependency.wait_value))
}

/// Write every counter update the kick carries, as the hardware does once the kick is done.
pub fn apply_counter_updates(descriptor: &KickDescriptor) {
    for update in &descriptor.counter_updates {
        update.counter.signal(update.value);
    }
}

/// Accepts kicks into a queue and retires them only when asked.
#[derive(Debug)]
pub struct RecordingKernel {
    event: KernelEvent,
    submitted: Vec<KickDescriptor>,
    in_flight: VecDeque<KickDescriptor>,
    fail_next: Option<KernelError>,
    auto_retire: bool,
}

impl RecordingKernel {
    pub fn new(event: KernelEvent) -> Self {
        Self {
            event,
            submitted: Vec::new(),
            in_flight: VecDeque::new(),
            fail_next: None,
            auto_retire: false,
        }
    }

    /// Retire each kick as soon as it is submitted.
    pub fn retiring_immediately(event: KernelEvent) -> Self {
        Self {
            auto_retire: true,
            ..Self::new(event)
        }
    }

    pub fn event(&self) -> &KernelEvent {
        &self.event
    }

    pub fn fail_next(&mut self, error: KernelError) {
        self.fail_next = Some(error);
    }

    pub fn submitted(&self) -> &[KickDescriptor] {
        &self.submitted
    }

    pub fn last_submitted(&self) -> Option<&KickDescriptor> {
        self.submitted.last()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Retire the oldest kick unless it still waits on another surface's render.
    pub fn retire_next(&mut self) -> Option<KickDescriptor> {
        let front = self.in_flight.front()?;
        if !dependencies_met(front) {
            trace!(surface = front.surface, "oldest kick still waits on a source render");
            return None;
        }
        let descriptor = self.in_flight.pop_front()?;
        apply_counter_updates(&descriptor);
        self.event.signal();
        trace!(surface = descriptor.surface, flags = ?descriptor.flags, "retired kick");
        Some(descriptor)
    }

    pub fn retire_all(&mut self) -> usize {
        let mut retired = 0;
        while self.retire_next().is_some() {
            retired += 1;
        }
        retired
    }
}

impl KernelServices for RecordingKernel {
    fn submit_kick(&mut self, descriptor: &KickDescriptor) -> Result<(), KernelError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        self.submitted.push(descriptor.clone());
        self.in_flight.push_back(descriptor.clone());
        if self.auto_retire {
            self.retire_all();
        }
        Ok(())
    }
}
