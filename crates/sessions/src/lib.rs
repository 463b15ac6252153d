//! Tab registry for supervised connections.
//!
//! A tab binds a UI handle to one connection identity. At most one tab per
//! connection exists, and whenever the registry is non-empty exactly one tab
//! is active.

mod registry;

pub use registry::{TabError, TabInfo, TabRegistry};
