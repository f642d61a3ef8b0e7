pub mod dag;
pub mod driver;
pub mod executor;
pub mod registry;
pub mod run;
pub mod trigger;

pub use dag::TaskGraph;
pub use driver::{run_to_completion, DriverHandle, RunDriver};
pub use executor::{ExecutionEngine, ReportReceiver, TaskReport};
pub use registry::GraphRegistry;
pub use run::{RunInstance, TaskInstance};
pub use trigger::{decide, evaluate, is_runnable, TriggerDecision};
