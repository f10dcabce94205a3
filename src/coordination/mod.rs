//! Pipeline coordination: job execution, gathering, publishing and the
//! orchestrator that sequences them

pub mod context;
pub mod fanout;
pub mod gatherer;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod task;

pub use context::RunContext;
pub use orchestrator::{IntegrationReport, Orchestrator, OutputLocation};
pub use registry::{Layout, Registry};
pub use task::{ProcessTaskFactory, TaskFactory};
