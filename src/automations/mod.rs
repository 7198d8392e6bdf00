//! Automation records: the authored trigger + action-list unit the rest of
//! the engine dispatches against (§3).

pub mod model;
