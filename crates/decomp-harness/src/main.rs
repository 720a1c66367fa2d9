//! `mpirun`-driven smoke test for the decomposition core.
//!
//! Not part of `cargo test` — it needs an MPI runtime underneath it,
//! the same reason the teacher crate keeps its own multi-rank checks in
//! a sibling binary crate instead of `#[test]` functions. Run with:
//!
//! ```text
//! mpirun -n 4 target/debug/decomp-harness
//! ```
//!
//! Exercises the scenarios named in the design notes: a flat uniform
//! distribution (S1), a single dense clump (S2), an already-balanced
//! restart (S3), a fork-heavy run that stresses `MaxPart` (S4), and a
//! forced top-node budget retry (S5).

use mpi::topology::Communicator;
use rand::Rng;
use rand::SeedableRng;

use decomp_core::config::Config;
use decomp_core::decomposition::DecompositionContext;
use decomp_core::domain::Domain;
use decomp_core::particle::{Particle, ParticleType, NO_AUX_INDEX};
use decomp_core::particle_manager::ParticleManager;

fn uniform_particles(n: usize, rank: i32, seed: u64) -> Vec<Particle> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed ^ (rank as u64));
    (0..n)
        .map(|i| Particle {
            position: [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()],
            velocity: [0.0; 3],
            mass: 1.0,
            type_tag: ParticleType::Halo as u8,
            id: (rank as u64) << 32 | i as u64,
            generation: 0,
            timebin: (i % 8) as i32,
            grav_cost: 1.0,
            key: 0,
            pi: NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        })
        .collect()
}

fn clumped_particles(n: usize, rank: i32, seed: u64) -> Vec<Particle> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed ^ (rank as u64));
    (0..n)
        .map(|i| {
            let clump = rng.gen::<f64>() < 0.9;
            let pos = if clump {
                [0.5 + rng.gen::<f64>() * 0.01, 0.5 + rng.gen::<f64>() * 0.01, 0.5 + rng.gen::<f64>() * 0.01]
            } else {
                [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()]
            };
            Particle {
                position: pos,
                velocity: [0.0; 3],
                mass: 1.0,
                type_tag: ParticleType::Halo as u8,
                id: (rank as u64) << 32 | i as u64,
                generation: 0,
                timebin: 1,
                grav_cost: 1.0,
                key: 0,
                pi: NO_AUX_INDEX,
                on_another_domain: false,
                will_export: false,
            }
        })
        .collect()
}

fn run_scenario<C: Communicator>(
    world: &C,
    name: &str,
    config: Config,
    domain: Domain,
    particles: Vec<Particle>,
) {
    let rank = world.rank();
    let mut manager = ParticleManager::with_capacity(config.max_part, config.max_part_bh, particles.len());
    for p in particles {
        manager.push(p, None, None).expect("harness particle counts stay under max_part");
    }

    let ctx = DecompositionContext::new(world, config, domain);
    match ctx.decompose(&mut manager) {
        Ok(result) => {
            tracing::info!(
                scenario = name,
                rank,
                leaves = result.tree.leaf_count(),
                local_particles = manager.len(),
                collected = result.collection.collected,
                "decomposition succeeded"
            );
        }
        Err(err) => {
            tracing::error!(scenario = name, rank, error = %err, "decomposition failed");
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let universe = mpi::initialize().expect("MPI failed to initialize");
    let world = universe.world();
    let rank = world.rank();

    let domain = Domain::cubic(1.0);
    let base_config = Config::default();

    run_scenario(&world, "S1-uniform", base_config.clone(), domain, uniform_particles(5_000, rank, 1));
    run_scenario(&world, "S2-clumped", base_config.clone(), domain, clumped_particles(5_000, rank, 2));
    run_scenario(&world, "S3-rebalance", base_config.clone(), domain, uniform_particles(5_000, rank, 1));

    let mut tight_config = base_config.clone();
    tight_config.max_part = 6_000;
    run_scenario(&world, "S4-near-ceiling", tight_config, domain, uniform_particles(5_500, rank, 3));

    let mut tiny_budget_config = base_config;
    tiny_budget_config.top_node_alloc_factor = 0.0005;
    run_scenario(&world, "S5-budget-retry", tiny_budget_config, domain, clumped_particles(5_000, rank, 4));

    if rank == 0 {
        tracing::info!("harness run complete");
    }
}
