//! Crate-wide constants for the Peano-Hilbert key space and top-tree shape.

/// Key type for a Peano-Hilbert ordinal and a per-axis grid coordinate.
pub type KeyType = u64;

/// Number of bits per axis. `2^BITS` cells per axis, comfortably over the
/// `2^20` floor required for locality at the leaf level.
pub const BITS: u32 = 21;

/// Number of cells per axis: `2^BITS`.
pub const GRID_SIZE: KeyType = 1 << BITS;

/// Total size of the Peano-Hilbert key space: `8^BITS`. `3 * BITS == 63`,
/// so this fits in a `u64` (the top bit is unused, keeping signed
/// conversions for MPI ranks/counts safe).
pub const PEANOCELLS: KeyType = 1u64 << (3 * BITS);

/// Deepest level of the implicit octree over the key space (one level per
/// bit triple).
pub const DEEPEST_LEVEL: u32 = BITS;

/// Fraction of a parent node's local count/cost that triggers refinement
/// during local top-tree construction (§4.3).
pub const REFINE_THRESHOLD: f64 = 0.8;

/// Refinement stops once a node's key-space size drops below this many
/// cells (the "8-cell floor").
pub const MIN_REFINE_CELLS: KeyType = 8;

/// `TIMEBASE`: divisor used for the work of a particle with `TimeBin == 0`.
pub const TIMEBASE: u64 = 1 << 20;

/// Constant in the post-merge leaf-quota formula (§4.3 "Post-merge
/// adaptation"): a leaf whose count/cost exceeds
/// `Total / (TOPNODEFACTOR * OverDecomp * NTask)` is subdivided.
pub const TOPNODEFACTOR: f64 = 4.0;

/// Maximum number of top-node-budget growth retries (§7, error kind 1)
/// before the condition is treated as fatal.
pub const MAX_BUDGET_RETRIES: u32 = 10;

/// Growth factor applied to the top-node budget after an overflow.
pub const BUDGET_GROWTH_FACTOR: f64 = 1.3;

/// Maximum number of round-robin shedding iterations during the exchange
/// receive-side safety loop (§4.6 step 4) before the condition is fatal.
pub const MAX_SHEDDING_ITERATIONS: u32 = 100;

/// Maximum number of outer exchange rounds (§4.6 "Round protocol") run
/// within a single decomposition before residue left by shedding is
/// treated as a structural corruption rather than retried. In practice
/// each round that sheds anything strictly reduces the global residue,
/// so this bounds an otherwise-open-ended loop rather than being
/// expected to trigger.
pub const MAX_EXCHANGE_ROUNDS: u32 = 64;
