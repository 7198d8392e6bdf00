//! C1 (Template & Condition Evaluator) and C2 (Action Executor), §4.1–§4.2.

pub mod condition;
pub mod context;
pub mod executor;
pub mod template;

pub use condition::evaluate_raw_filter;
pub use context::{Context, UserInfo};
pub use executor::{ActionExecutor, ActionOutcome, ActionResult, ExecutionResult, ExecutionStatus};
