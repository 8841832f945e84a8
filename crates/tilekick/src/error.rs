use command_ring::RingReserveError;
use completion_waiter::{RetryConfigError, WaitError, WaitKind};
use kick_protocol::SurfaceId;
use kick_submit::{KernelError, KickError};
use render_surface::SurfaceError;
use resource_tracker::TrackerError;

/// Error state latched for the drawing API, reported on its next error query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    OutOfMemory,
    OperationFailed,
    InvalidOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
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
    #[error("surface {surface}: {kind:?} wait for {target} timed out")]
    WaitTimeout {
        surface: SurfaceId,
        kind: WaitKind,
        target: u32,
    },
    #[error("surface {surface}: wait was cancelled")]
    WaitCancelled { surface: SurfaceId },
    #[error("surface {surface}: device lost")]
    DeviceLost { surface: SurfaceId },
    #[error("unknown surface {surface}")]
    UnknownSurface { surface: SurfaceId },
    #[error("surface {surface} has no scene open")]
    SceneNotOpen { surface: SurfaceId },
    #[error("no device memory for {bytes} bytes")]
    OutOfDeviceMemory { bytes: u64 },
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("invalid driver config: {0}")]
    Config(#[from] RetryConfigError),
}

impl DriverError {
    pub fn api_error(&self) -> ApiError {
        match self {
            DriverError::BufferSpaceExhausted { .. }
            | DriverError::KickSubmissionFailed { .. }
            | DriverError::CounterUpdateListFull { .. }
            | DriverError::OutOfDeviceMemory { .. } => ApiError::OutOfMemory,
            DriverError::WaitTimeout { .. }
            | DriverError::WaitCancelled { .. }
            | DriverError::DeviceLost { .. } => ApiError::OperationFailed,
            DriverError::UnknownSurface { .. }
            | DriverError::SceneNotOpen { .. }
            | DriverError::Surface(_)
            | DriverError::Tracker(_)
            | DriverError::Config(_) => ApiError::InvalidOperation,
        }
    }

    pub(crate) fn from_wait(surface: SurfaceId, error: WaitError) -> Self {
        match error {
            WaitError::Timeout { kind, target, .. } => DriverError::WaitTimeout {
                surface,
                kind,
                target,
            },
            WaitError::Cancelled { .. } => DriverError::WaitCancelled { surface },
            WaitError::DeviceLost { .. } => DriverError::DeviceLost { surface },
        }
    }
}

impl From<KickError> for DriverError {
    fn from(error: KickError) -> Self {
        match error {
            KickError::BufferSpaceExhausted { surface, source } => {
                DriverError::BufferSpaceExhausted { surface, source }
            }
            KickError::KickSubmissionFailed { surface, source } => {
                DriverError::KickSubmissionFailed { surface, source }
            }
            KickError::CounterUpdateListFull { surface, updates } => {
                DriverError::CounterUpdateListFull { surface, updates }
            }
        }
    }
}
