//! Error kinds recognized by the decomposition core (§7 of the design).
//!
//! Recoverable conditions (top-node budget overflow, memory-ceiling
//! violation, exchange overflow) are retried by the orchestration in
//! [`crate::decomposition`] up to a bounded number of attempts; once that
//! bound is hit, or when the condition is inherently unrecoverable
//! (structural corruption, particle table overflow), the error is
//! returned to the caller, who is expected to abort the process group
//! after logging diagnostic context from every rank.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecompError {
    /// The top-tree node allocator ran out of budget during local
    /// refinement or global merge. Recoverable: grow the budget by
    /// [`crate::constants::BUDGET_GROWTH_FACTOR`] and restart the whole
    /// decomposition, up to [`crate::constants::MAX_BUDGET_RETRIES`] times.
    #[error("top-node budget of {budget} nodes exceeded during {phase}")]
    TopNodeBudgetExceeded { budget: usize, phase: &'static str },

    /// Repeated top-node budget overflow past the retry cap.
    #[error("top-node budget retries exhausted after {attempts} attempts (last budget {budget})")]
    TopNodeBudgetRetriesExhausted { attempts: u32, budget: usize },

    /// A trial split/assignment would put more than `MaxPart` particles
    /// (or `MaxPartBh` black holes) on some rank. Recoverable by falling
    /// back from the work-balanced split to the load-balanced split;
    /// unrecoverable if the load-balanced split also violates the
    /// ceiling.
    #[error("rank {rank} would hold {projected} particles, exceeding the ceiling of {ceiling}")]
    MemoryCeilingExceeded {
        rank: i32,
        projected: usize,
        ceiling: usize,
    },

    /// Inbound particles for some rank would exceed `MaxPart`/`MaxPartBh`
    /// even after round-robin shedding. Recoverable up to
    /// [`crate::constants::MAX_SHEDDING_ITERATIONS`] shedding rounds.
    #[error("exchange overflow on rank {rank}: {inbound} inbound {kind} exceeds ceiling {ceiling}")]
    ExchangeOverflow {
        rank: i32,
        inbound: usize,
        ceiling: usize,
        kind: &'static str,
    },

    /// Round-robin shedding failed to converge within the iteration cap.
    #[error("exchange shedding did not converge after {iterations} iterations")]
    ExchangeSheddingExhausted { iterations: u32 },

    /// An incoming top-tree node was structurally inconsistent with the
    /// local tree (larger than its local counterpart), an auxiliary
    /// index referred to a slot with a mismatched identifier, or a
    /// duplicate particle identifier was observed. Always fatal.
    #[error("structural corruption: {detail}")]
    StructuralCorruption { detail: String },

    /// A fork pushed `NumPart`, `N_gas`, or `N_bh` past its hard bound.
    /// Always fatal.
    #[error("particle table overflow: {table} holds {count}, bound is {bound}")]
    ParticleTableOverflow {
        table: &'static str,
        count: usize,
        bound: usize,
    },
}

pub type Result<T> = std::result::Result<T, DecompError>;
