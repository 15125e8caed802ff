mod job;
mod route;

pub use job::{Job, Run, RouteIds};
pub use route::{Route, RouteExecution, RouteStatus, StepTiming, StepTimings};
