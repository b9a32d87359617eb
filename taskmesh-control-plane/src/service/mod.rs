pub mod aggregator;
pub mod dispatcher;
pub mod execution;
pub mod registrar;
pub mod result;
pub mod screenshot;
pub mod stop;

pub use aggregator::PlanAggregator;
pub use dispatcher::Dispatcher;
pub use execution::{ExecutionError, ExecutionService};
pub use registrar::{RegistrarError, WorkerRegistrar};
pub use result::{ResultError, ResultHandler};
pub use screenshot::{ScreenshotError, ScreenshotService};
pub use stop::{StopController, StopError};
