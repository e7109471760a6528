//! Completion primitives and execution contexts.
//!
//! - `result`: [`AsyncResult`](result::AsyncResult), the single-assignment cell
//! - `composite`: ALL / ANY / JOIN roll-ups over a set of results
//! - `context`: owning execution contexts and their task queues

pub(crate) mod composite;
pub(crate) mod context;
pub(crate) mod result;
