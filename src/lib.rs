//! watchbox: bounded-resource supervision of a single child process.
//!
//! Spawn an external program with stdio redirected to caller-provided
//! endpoints, a CPU-time limit and a memory limit attached, and receive a
//! structured post-mortem: exit status, peak resident memory, CPU time
//! consumed, and the cause of termination (time limit, memory limit,
//! external cancellation, or none of these). One supervisor watches
//! exactly one child; independent spawns share nothing.

pub mod cancel;
pub mod classify;
pub mod clock;
pub mod limits;
pub mod monitor;
pub mod observability;
pub mod probe;
pub mod stdio;
pub mod types;

pub use cancel::CancelChannel;
pub use monitor::{spawn, MonitorHandle};
pub use stdio::IoEndpoint;
pub use types::{CompletionRecord, MonitorError, Result, SpawnRequest};
