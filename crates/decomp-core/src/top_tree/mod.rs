//! The top tree: a coarse octree over Peano-Hilbert key space, built
//! locally on each rank, merged globally, then adapted so every rank
//! gets enough leaves to balance against (§4.3).

mod builder;
mod node;

pub use builder::{adapt_to_task_count, build_local, merge, TopTree};
pub use node::{TopTreeNode, NO_NODE};
