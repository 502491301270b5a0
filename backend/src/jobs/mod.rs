// Background Jobs
//
// The billing cycle and the daily scheduler that drives it. Scheduling is an
// explicit trigger loop; a cycle can also be run once from the command line.

pub mod recurring_billing;
pub mod scheduler;

pub use recurring_billing::{BillingJobResult, ContractOutcome, ContractReport, RecurringBillingJob};
pub use scheduler::{DailyTrigger, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
