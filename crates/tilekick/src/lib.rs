//! Driver context for a tile-based deferred-rendering GPU: scenes, kicks and the lifetime of
//! the resources those kicks read.

mod config;
mod context;
mod error;

pub use config::DriverConfig;
pub use context::{DrawRecord, DriverContext, DriverServices, SharedResources};
pub use error::{ApiError, DriverError};
