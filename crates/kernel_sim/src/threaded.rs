use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use completion_waiter::KernelEvent;
use kick_protocol::KickDescriptor;
use kick_submit::{KernelError, KernelServices};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tracing::{debug, error, trace};

use crate::{apply_counter_updates, dependencies_met};

#[derive(Debug, Default)]
struct GpuShared {
    stop_requested: AtomicBool,
    paused: AtomicBool,
    retired: AtomicU64,
}

/// Simulated GPU on its own thread. Kicks travel over a single-producer ring; the worker
/// retires them in order, writing counters and raising the kernel event.
pub struct ThreadedKernel {
    producer: Producer<KickDescriptor>,
    shared: Arc<GpuShared>,
    worker: Option<JoinHandle<()>>,
    fail_next: Option<KernelError>,
    submitted: u64,
}

impl ThreadedKernel {
    pub fn spawn(event: KernelEvent, queue_capacity: usize) -> Self {
        Self::spawn_with_state(event, queue_capacity, false)
    }

    /// Spawn with retirement held back, so the first kicks stay in flight until `resume`.
    pub fn spawn_paused(event: KernelEvent, queue_capacity: usize) -> Self {
        Self::spawn_with_state(event, queue_capacity, true)
    }

    fn spawn_with_state(event: KernelEvent, queue_capacity: usize, paused: bool) -> Self {
        let (producer, consumer) = RingBuffer::new(queue_capacity);
        let shared = Arc::new(GpuShared {
            paused: AtomicBool::new(paused),
            ..GpuShared::default()
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("tilekick-sim-gpu".to_owned())
            .spawn(move || run_gpu_loop(worker_shared, consumer, event))
            .unwrap_or_else(|error| panic!("failed to spawn simulated gpu thread: {error}"));
        Self {
            producer,
            shared,
            worker: Some(worker),
            fail_next: None,
            submitted: 0,
        }
    }

    /// Stop retiring kicks until [`ThreadedKernel::resume`].
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn fail_next(&mut self, error: KernelError) {
        self.fail_next = Some(error);
    }

    pub fn submitted_kicks(&self) -> u64 {
        self.submitted
    }

    pub fn retired_kicks(&self) -> u64 {
        self.shared.retired.load(Ordering::Acquire)
    }

    pub fn shutdown(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("simulated gpu thread panicked");
        }
    }
}

impl KernelServices for ThreadedKernel {
    fn submit_kick(&mut self, descriptor: &KickDescriptor) -> Result<(), KernelError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        if self.worker.is_none() {
            return Err(KernelError::DeviceLost);
        }
        match self.producer.push(descriptor.clone()) {
            Ok(()) => {
                self.submitted += 1;
                Ok(())
            }
            Err(PushError::Full(_)) => Err(KernelError::ResourceLimit),
        }
    }
}

impl Drop for ThreadedKernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadedKernel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ThreadedKernel")
            .field("submitted", &self.submitted)
            .field("retired", &self.retired_kicks())
            .field("paused", &self.shared.paused.load(Ordering::Acquire))
            .finish()
    }
}

fn run_gpu_loop(
    shared: Arc<GpuShared>,
    mut consumer: Consumer<KickDescriptor>,
    event: KernelEvent,
) {
    const IDLE_SLEEP_DURATION: Duration = Duration::from_micros(200);
    const KICK_BUDGET: usize = 64;

    let mut blocked: Option<KickDescriptor> = None;
    while !shared.stop_requested.load(Ordering::Acquire) {
        if shared.paused.load(Ordering::Acquire) {
            thread::sleep(IDLE_SLEEP_DURATION);
            continue;
        }

        let mut retired_this_pass = 0;
        for _ in 0..KICK_BUDGET {
            let descriptor = match blocked.take() {
                Some(descriptor) => descriptor,
                None => match consumer.pop() {
                    Ok(descriptor) => descriptor,
                    Err(rtrb::PopError::Empty) => break,
                },
            };
            if !dependencies_met(&descriptor) {
                trace!(surface = descriptor.surface, "simulated gpu waiting on source render");
                blocked = Some(descriptor);
                break;
            }
            apply_counter_updates(&descriptor);
            shared.retired.fetch_add(1, Ordering::AcqRel);
            retired_this_pass += 1;
        }

        if retired_this_pass > 0 {
            event.signal();
        } else {
            thread::sleep(IDLE_SLEEP_DURATION);
        }
    }
    debug!(
        retired = shared.retired.load(Ordering::Acquire),
        "simulated gpu stopped"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use completion_waiter::{EventWait, EventWaitStatus};
    use kick_protocol::{CompletionCounter, CounterTarget, CounterUpdate, KickFlags};

    use super::*;

    fn closing_kick(counter: &CompletionCounter) -> KickDescriptor {
        let mut descriptor = KickDescriptor::new(
            1,
            KickFlags::FIRST_IN_SCENE | KickFlags::LAST_IN_SCENE,
        );
        descriptor.counter_updates.push(CounterUpdate {
            target: CounterTarget::RenderCompletion,
            counter: counter.clone(),
            value: counter.reserve_next(),
        });
        descriptor
    }

    fn wait_for(counter: &CompletionCounter, target: u32, event: &KernelEvent) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !counter.is_reached(target) {
            assert!(Instant::now() < deadline, "simulated gpu never confirmed {target}");
            let _ = event.wait_timeout(Duration::from_millis(10));
        }
    }

    #[test]
    fn worker_retires_kicks_and_signals_event() {
        let event = KernelEvent::new();
        let mut kernel = ThreadedKernel::spawn(event.clone(), 8);
        let counter = CompletionCounter::new();

        kernel
            .submit_kick(&closing_kick(&counter))
            .expect("kick queued");
        wait_for(&counter, 1, &event);

        assert_eq!(kernel.retired_kicks(), 1);
        kernel.shutdown();
    }

    #[test]
    fn paused_worker_holds_kicks_until_resumed() {
        let event = KernelEvent::new();
        let mut kernel = ThreadedKernel::spawn_paused(event.clone(), 8);
        let counter = CompletionCounter::new();

        kernel
            .submit_kick(&closing_kick(&counter))
            .expect("kick queued");
        assert_eq!(
            event.wait_timeout(Duration::from_millis(20)),
            EventWaitStatus::TimedOut
        );
        assert_eq!(counter.current(), 0);

        kernel.resume();
        wait_for(&counter, 1, &event);
        kernel.shutdown();
    }

    #[test]
    fn full_queue_reports_resource_limit() {
        let event = KernelEvent::new();
        let mut kernel = ThreadedKernel::spawn_paused(event, 1);
        let counter = CompletionCounter::new();

        kernel
            .submit_kick(&closing_kick(&counter))
            .expect("first kick queued");
        assert_eq!(
            kernel.submit_kick(&closing_kick(&counter)),
            Err(KernelError::ResourceLimit)
        );
    }

    #[test]
    fn submission_after_shutdown_is_device_lost() {
        let mut kernel = ThreadedKernel::spawn(KernelEvent::new(), 4);
        kernel.shutdown();
        let counter = CompletionCounter::new();

        assert_eq!(
            kernel.submit_kick(&closing_kick(&counter)),
            Err(KernelError::DeviceLost)
        );
    }
}
