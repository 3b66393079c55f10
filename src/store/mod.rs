//! Store: the sole mediator of persistent state
//!
//! Every SQL statement in the engine lives under this module, one file per
//! table family. All multi-row mutations that affect a state transition are
//! transactional, and claiming is done with `FOR UPDATE SKIP LOCKED` -- the
//! engine's concurrency primitive.

mod agents;
mod compaction;
mod instances;
mod iterations;
mod leader;
mod messages;
mod runs;
mod sessions;
mod tool_executions;

pub use compaction::CompactionPlan;
pub use iterations::{CompletedIteration, NewIteration, NewToolExecution};
pub use runs::NewRun;

use sqlx::PgPool;

/// Handle to the engine's persistent state. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool (exposed to tool contexts)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
