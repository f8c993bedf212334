pub mod catalog;
pub mod compiler;
pub mod coordinator;
pub mod runner;
pub mod template;
pub mod validator;

pub use catalog::WorkflowCatalog;
pub use compiler::{compile, ExecutionPlan};
pub use coordinator::{ExecutionCoordinator, ExecutionSnapshot, StepJobPayload, STEP_JOB_NAME};
pub use runner::{StepContext, StepOutcome, StepRunner};
pub use validator::{validate, IssueCode, ValidationIssue, ValidationReport};
