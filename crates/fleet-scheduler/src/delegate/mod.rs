//! Per-node delegates
//!
//! A delegate is the scheduler's record of one fleet node: its declared
//! resources, its beacon stamp, and (for backends) the model instances and
//! throughput reservations it currently holds. Delegates are owned by the
//! registry and only ever mutated under the registry mutex; their control
//! handles are cloned out for post-mutex I/O.

mod backend;
mod frontend;

pub use backend::{BackendDelegate, BackendSpec, PreparedLoad};
pub use frontend::FrontendDelegate;
