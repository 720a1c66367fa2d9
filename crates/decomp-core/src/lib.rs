//! Distributed domain decomposition and particle exchange for a
//! parallel N-body code: Peano-Hilbert key assignment, a merged global
//! top tree, work-balanced splitting across ranks, and the particle
//! exchange and garbage collection that follow a new split (§1-§9).

pub mod config;
pub mod constants;
pub mod decomposition;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod garbage_collector;
pub mod particle;
pub mod particle_manager;
pub mod peano;
pub mod slots;
pub mod splitter;
pub mod summarizer;
pub mod top_tree;

pub use config::Config;
pub use decomposition::{DecompositionContext, DecompositionResult};
pub use domain::Domain;
pub use error::{DecompError, Result};
pub use particle::{Particle, ParticleType};
pub use particle_manager::ParticleManager;
pub use peano::PeanoKey;
