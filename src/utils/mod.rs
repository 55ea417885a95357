pub mod archive;
pub mod cancel;
pub mod command;
pub mod locker;
pub mod workspace;

// Trait-based abstractions for testability
pub mod executor;

// Re-export commonly used types and traits (used by test crate)
pub use cancel::{CancelToken, Cancelled};
pub use executor::{CommandExecutor, RealExecutor};
pub use locker::RunLocks;
pub use workspace::RunWorkspace;
