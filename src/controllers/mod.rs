//! Controllers for the AutoMQ Kubernetes Operator
//!
//! The AutoMQ controller watches AutoMQ resources and converges the
//! controller and broker role groups through an ordered step pipeline.

mod automq;
pub mod pipeline;
pub mod refresher;
pub mod scale;
pub mod status;

pub use automq::{run, AutoMQReconciler};
pub use pipeline::{ReconcileStep, StepContext, StepOutcome};
pub use refresher::StatusRefresher;
