//! Kick resource tracking: which in-flight kicks may still read a resource, and who owns its
//! memory once the API object behind it is deleted.

mod group;
mod tracker;

pub use group::{ForceKick, ResourceGroup, ResourceNamespace};
pub use tracker::{
    GhostError, GhostOutcome, KickResourceTracker, ReclaimReport, ResourceHandle, ResourceKind,
    ResourceName, SurfaceDetach, TrackedResourceKey, UNNAMED, UseLink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("resource {key:?} is not tracked")]
    UnknownResource { key: TrackedResourceKey },
    #[error("resource name {name} is not bound")]
    UnknownName { name: ResourceName },
    #[error("resource {key:?} is already a ghost")]
    AlreadyGhosted { key: TrackedResourceKey },
    #[error("resource {key:?} was deleted and cannot be linked into a new kick")]
    GhostedResourceUse { key: TrackedResourceKey },
    #[error("resource {key:?} is still referenced by an in-flight kick")]
    ResourceStillInUse { key: TrackedResourceKey },
}
