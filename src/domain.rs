//! Domain layer
//!
//! Plain data and pure logic: the billing calendar, job lifecycle, provider
//! response model and the contracts the application layer talks through.

pub mod billing_period;
pub mod entities;
pub mod job_state;
pub mod provider_response;
pub mod repositories;
pub mod run;
pub mod services;
pub mod status_codes;

pub use billing_period::{BillingError, PeriodType};
pub use entities::{Account, AccountRule, ExecutionType, Job, JobExecution, JobType};
pub use job_state::{JobEvent, JobStatus, TransitionError};
pub use run::{OrchestrationRun, PhaseFlags, RunPhase, RunStatus};
