mod retry;

pub use retry::{
    BoundedRetry, CancelToken, Clock, EventWait, EventWaitStatus, ManualClock, RetryConfig,
    RetryConfigError, RetryError, RetryPause, RetryReport, SystemClock,
};

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use kick_protocol::CompletionCounter;
use tracing::{trace, warn};

/// Event the kernel side raises after it writes completion counters.
///
/// Signals coalesce: any number of `signal` calls before a wait wake it once.
#[derive(Debug, Clone)]
pub struct KernelEvent {
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
}

impl KernelEvent {
    pub fn new() -> Self {
        let (notify_sender, notify_receiver) = bounded(1);
        Self {
            notify_sender,
            notify_receiver,
        }
    }

    pub fn signal(&self) {
        match self.notify_sender.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                panic!("kernel event notify channel disconnected")
            }
        }
    }
}

impl Default for KernelEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl EventWait for KernelEvent {
    fn wait_timeout(&self, timeout: Duration) -> EventWaitStatus {
        match self.notify_receiver.recv_timeout(timeout) {
            Ok(()) => EventWaitStatus::Signalled,
            Err(RecvTimeoutError::Timeout) => EventWaitStatus::TimedOut,
            Err(RecvTimeoutError::Disconnected) => EventWaitStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// The hardware has consumed the command stream words.
    CommandStream,
    /// The hardware has finished producing pixels.
    RenderCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("{kind:?} wait for {target} timed out at {observed} after {attempts} retries")]
    Timeout {
        kind: WaitKind,
        target: u32,
        observed: u32,
        attempts: u32,
    },
    #[error("{kind:?} wait for {target} cancelled")]
    Cancelled { kind: WaitKind, target: u32 },
    #[error("{kind:?} wait lost its kernel event")]
    DeviceLost { kind: WaitKind },
}

pub struct CompletionWaiter {
    command_stream: BoundedRetry,
    render_completion: BoundedRetry,
    clock: Arc<dyn Clock>,
    event: Arc<dyn EventWait>,
    cancel: CancelToken,
}

impl CompletionWaiter {
    pub fn new(
        command_stream: RetryConfig,
        render_completion: RetryConfig,
        clock: Arc<dyn Clock>,
        event: Arc<dyn EventWait>,
    ) -> Self {
        Self {
            command_stream: BoundedRetry::new(command_stream),
            render_completion: BoundedRetry::new(render_completion),
            clock,
            event,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn event(&self) -> &Arc<dyn EventWait> {
        &self.event
    }

    /// Block until `counter` reaches `target`. Must not be called with a tracker lock held.
    pub fn wait(
        &self,
        counter: &CompletionCounter,
        target: u32,
        kind: WaitKind,
    ) -> Result<(), WaitError> {
        let retry = match kind {
            WaitKind::CommandStream => &self.command_stream,
            WaitKind::RenderCompletion => &self.render_completion,
        };
        let result = retry.run(
            self.clock.as_ref(),
            RetryPause::Event(self.event.as_ref()),
            Some(&self.cancel),
            || counter.is_reached(target),
        );
        match result {
            Ok(report) => {
                trace!(?kind, target, attempts = report.attempts, "completion wait satisfied");
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, waited }) => {
                let observed = counter.current();
                warn!(
                    ?kind,
                    target,
                    observed,
                    attempts,
                    waited_ms = waited.as_millis() as u64,
                    "completion wait exhausted its retry budget"
                );
                Err(WaitError::Timeout {
                    kind,
                    target,
                    observed,
                    attempts,
                })
            }
            Err(RetryError::Cancelled { .. }) => Err(WaitError::Cancelled { kind, target }),
            Err(RetryError::EventDisconnected { .. }) => Err(WaitError::DeviceLost { kind }),
        }
    }
}

impl std::fmt::Debug for CompletionWaiter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CompletionWaiter")
            .field("command_stream", &self.command_stream)
            .field("render_completion", &self.render_completion)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
