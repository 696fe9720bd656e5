//! Stream dispatch and local session bookkeeping
//!
//! # Components
//!
//! - `StreamDispatcher` - routes a stream request to a gateway or a local session
//! - `SessionRegistry` - live local sessions, capacity limit and reaping
//! - `PipelineClient` - gateway API for remote capture devices

pub mod dispatcher;
pub mod registry;
pub mod remote;

pub use dispatcher::{StreamDispatcher, StreamStrategy};
pub use registry::{run_reaper, SessionRegistry, SessionSlot};
pub use remote::{HttpPipelineClient, PipelineClient};
