//! Top-level orchestration (§2): assigns Peano keys, builds and merges
//! the top tree, splits and assigns leaf ranges to ranks, exchanges
//! particles into place, and garbage-collects the result. This is the
//! one entry point downstream simulation code calls once per domain
//! decomposition.

use mpi::topology::Communicator;
use tracing::instrument;

use crate::config::Config;
use crate::constants::{BUDGET_GROWTH_FACTOR, MAX_BUDGET_RETRIES, MAX_EXCHANGE_ROUNDS};
use crate::domain::Domain;
use crate::error::{DecompError, Result};
use crate::exchange::{self, ExchangePlan};
use crate::garbage_collector::{self, CollectionReport};
use crate::particle::ParticleType;
use crate::particle_manager::ParticleManager;
use crate::slots::{BlackHoleSlot, GasSlot};
use crate::splitter::{self, RankRange};
use crate::summarizer;
use crate::top_tree::TopTree;

/// Everything produced by one successful decomposition, kept around so
/// the caller (or the next decomposition) can query which rank owns a
/// given key without rebuilding the tree.
pub struct DecompositionResult {
    pub tree: TopTree,
    pub ranges: Vec<RankRange>,
    pub collection: CollectionReport,
}

pub struct DecompositionContext<'c, C: Communicator> {
    world: &'c C,
    config: Config,
    domain: Domain,
}

impl<'c, C: Communicator> DecompositionContext<'c, C> {
    pub fn new(world: &'c C, config: Config, domain: Domain) -> Self {
        DecompositionContext { world, config, domain }
    }

    fn n_ranks(&self) -> usize {
        self.world.size() as usize
    }

    fn my_rank(&self) -> usize {
        self.world.rank() as usize
    }

    /// Runs one full decomposition in place over `manager`.
    #[instrument(skip_all, fields(rank = self.my_rank(), n_ranks = self.n_ranks(), local_particles = manager.len()))]
    pub fn decompose(&self, manager: &mut ParticleManager) -> Result<DecompositionResult> {
        self.assign_keys(manager);

        let (tree, ranges) = self.build_tree_and_split(manager)?;

        self.run_exchange_rounds(manager, &tree, &ranges)?;

        let collection = garbage_collector::collect(manager)?;

        Ok(DecompositionResult { tree, ranges, collection })
    }

    /// Runs [`Self::exchange_into_place`] repeatedly until no rank sheds
    /// any particle, i.e. every particle has reached the rank its key
    /// maps to (§4.6 "Round protocol": "Iteratively until no rank has
    /// remaining exports"). [`exchange::shed_overflow`] is computed from
    /// a matrix every rank gathered identically, so its shed-iteration
    /// count is already the same value everywhere — no extra collective
    /// is needed to agree on whether another round is required. Each
    /// round that sheds anything strictly shrinks the global residue, so
    /// [`MAX_EXCHANGE_ROUNDS`] is a backstop rather than an expected
    /// limit.
    fn run_exchange_rounds(&self, manager: &mut ParticleManager, tree: &TopTree, ranges: &[RankRange]) -> Result<()> {
        for round in 0..MAX_EXCHANGE_ROUNDS {
            let shed_iterations = self.exchange_into_place(manager, tree, ranges)?;
            if shed_iterations == 0 {
                return Ok(());
            }
            tracing::warn!(round, shed_iterations, "exchange round left residue, running another round");
        }
        Err(DecompError::StructuralCorruption {
            detail: format!("exchange did not converge after {MAX_EXCHANGE_ROUNDS} rounds"),
        })
    }

    fn assign_keys(&self, manager: &mut ParticleManager) {
        for p in manager.particles_mut() {
            p.assign_key(&self.domain);
        }
    }

    /// Builds the global top tree and a work-balanced split, retrying
    /// with a larger node budget on [`DecompError::TopNodeBudgetExceeded`]
    /// up to [`MAX_BUDGET_RETRIES`] times (§7).
    fn build_tree_and_split(&self, manager: &ParticleManager) -> Result<(TopTree, Vec<RankRange>)> {
        let mut budget = self.config.initial_top_node_budget();
        let mut attempt = 0u32;

        loop {
            match self.try_build_tree_and_split(manager, budget) {
                Ok(result) => return Ok(result),
                Err(DecompError::TopNodeBudgetExceeded { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_BUDGET_RETRIES {
                        return Err(DecompError::TopNodeBudgetRetriesExhausted { attempts: attempt, budget });
                    }
                    budget = ((budget as f64) * BUDGET_GROWTH_FACTOR).ceil() as usize;
                    tracing::warn!(attempt, budget, "retrying top-tree build with a larger node budget");
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn try_build_tree_and_split(&self, manager: &ParticleManager, budget: usize) -> Result<(TopTree, Vec<RankRange>)> {
        let mut sorted: Vec<(crate::constants::KeyType, f64)> =
            manager.particles().iter().map(|p| (p.key, p.work())).collect();
        sorted.sort_unstable_by_key(|&(key, _)| key);

        let mut tree = crate::top_tree::build_local(&sorted, budget)?;
        tree.assign_leaf_ordinals();

        self.merge_global(&mut tree, budget)?;
        crate::top_tree::adapt_to_task_count(
            &mut tree,
            self.n_ranks(),
            self.config.over_decomp,
            self.config.topnodefactor,
            budget,
        )?;
        tree.assign_leaf_ordinals();

        let local_totals = summarizer::summarize_local(&tree, manager.particles());
        let global_totals = summarizer::reduce_global(self.world, &local_totals);
        summarizer::apply_totals(&mut tree, &global_totals);

        let total_particles: i64 = global_totals.count.iter().sum();
        let max_part = self
            .config
            .max_part_for(total_particles as usize, self.n_ranks())
            .min(self.config.max_part);

        let ranges = splitter::split(&tree, self.n_ranks(), self.config.over_decomp, max_part)?;
        Ok((tree, ranges))
    }

    /// Recursive-doubling merge across ranks: at step `s`, rank `r`
    /// exchanges its current tree with rank `r ^ 2^s` and folds the
    /// partner's tree in, so after `ceil(log2(n_ranks))` steps every
    /// rank (when `n_ranks` is a power of two) holds the same, fully
    /// merged tree. For non-power-of-two task counts the highest ranks
    /// without a partner at some step simply keep their own tree that
    /// round; this trades a small amount of imbalance in that case for
    /// not needing a separate reduction tree topology (documented as a
    /// deliberate simplification).
    fn merge_global(&self, tree: &mut TopTree, budget: usize) -> Result<()> {
        let n_ranks = self.n_ranks();
        if n_ranks <= 1 {
            return Ok(());
        }
        let my_rank = self.my_rank();
        let mut step = 1usize;
        while step < n_ranks {
            let partner = my_rank ^ step;
            if partner < n_ranks {
                let payload = serde_json::to_vec(tree).expect("top tree is always serializable");
                let payload_len = payload.len() as u64;
                let partner_process = self.world.process_at_rank(partner as i32);

                let recv_bytes = if my_rank < partner {
                    partner_process.send(&payload_len);
                    partner_process.send(&payload[..]);
                    let mut recv_len = 0u64;
                    partner_process.receive_into(&mut recv_len);
                    let mut recv_buf = vec![0u8; recv_len as usize];
                    partner_process.receive_into(&mut recv_buf[..]);
                    recv_buf
                } else {
                    let mut recv_len = 0u64;
                    partner_process.receive_into(&mut recv_len);
                    let mut recv_buf = vec![0u8; recv_len as usize];
                    partner_process.receive_into(&mut recv_buf[..]);
                    partner_process.send(&payload_len);
                    partner_process.send(&payload[..]);
                    recv_buf
                };
                let partner_tree: TopTree =
                    serde_json::from_slice(&recv_bytes).map_err(|e| DecompError::StructuralCorruption {
                        detail: format!("could not decode merged top tree from rank {partner}: {e}"),
                    })?;
                crate::top_tree::merge(tree, &partner_tree, budget)?;
            }
            step <<= 1;
        }
        Ok(())
    }

    /// Ships every particle (and gas/black-hole auxiliary state) to the
    /// rank its key now belongs to, with round-robin shedding if the
    /// naive plan would overflow someone's `max_part` (§4.6, §7). Returns
    /// the number of shedding iterations [`exchange::shed_overflow`]
    /// needed, which is `0` exactly when every particle reached its
    /// target this round.
    #[instrument(skip_all, fields(rank = self.my_rank(), local_particles = manager.len()))]
    fn exchange_into_place(&self, manager: &mut ParticleManager, tree: &TopTree, ranges: &[RankRange]) -> Result<u32> {
        let n_ranks = self.n_ranks();
        let my_rank = self.my_rank();

        let particles = manager.particles().to_vec();
        let targets = exchange::target_ranks(&particles, tree, ranges);
        let my_row = exchange::to_go_counts(&targets, n_ranks);

        let mut matrix = exchange::gather_matrix(self.world, &my_row, n_ranks);
        let shed_iterations = exchange::shed_overflow(&mut matrix, self.config.max_part)?;

        let plan = ExchangePlan::from_matrix(&matrix, my_rank);
        let (packed, sent) = exchange::pack_by_target(&particles, &targets, &plan.send_counts);
        let mut received = exchange::exchange_particles(self.world, &plan, &packed, self.config.no_isend_irecv);

        let gas_send_counts = exchange::aux_send_counts(&particles, &targets, &sent, n_ranks, ParticleType::Gas);
        let gas_recv_counts = exchange::gather_matrix(self.world, &gas_send_counts, n_ranks)
            .iter()
            .map(|row| row[my_rank])
            .collect::<Vec<_>>();
        let gas_send_buf = exchange::pack_aux_slots(&particles, &targets, &sent, manager.gas_slots(), ParticleType::Gas, &gas_send_counts);
        let received_gas: Vec<GasSlot> = exchange::exchange_slots(
            self.world,
            &gas_send_counts,
            &gas_recv_counts,
            &gas_send_buf,
            self.config.no_isend_irecv,
        );

        let bh_send_counts = exchange::aux_send_counts(&particles, &targets, &sent, n_ranks, ParticleType::BlackHole);
        let bh_recv_counts = exchange::gather_matrix(self.world, &bh_send_counts, n_ranks)
            .iter()
            .map(|row| row[my_rank])
            .collect::<Vec<_>>();
        let bh_send_buf = exchange::pack_aux_slots(
            &particles,
            &targets,
            &sent,
            manager.black_hole_slots(),
            ParticleType::BlackHole,
            &bh_send_counts,
        );
        let received_bh: Vec<BlackHoleSlot> = exchange::exchange_slots(
            self.world,
            &bh_send_counts,
            &bh_recv_counts,
            &bh_send_buf,
            self.config.no_isend_irecv,
        );

        let base_gas_index = manager.gas_slots().len() as i64;
        let base_bh_index = manager.black_hole_slots().len() as i64;
        exchange::relink_pi(&mut received, base_gas_index, base_bh_index);

        *manager = rebuild_manager(manager, &received, &received_gas, &received_bh, &sent)?;
        Ok(shed_iterations)
    }
}

/// Rebuilds a `ParticleManager` from this round's received rows:
/// particles this rank did not export (`sent == false`, whether
/// because they already belonged here or because shedding kept them
/// back for another round) plus everything just arrived from the
/// base/gas/black-hole exchanges.
fn rebuild_manager(
    old: &ParticleManager,
    received_particles: &[crate::particle::Particle],
    received_gas: &[GasSlot],
    received_bh: &[BlackHoleSlot],
    sent: &[bool],
) -> Result<ParticleManager> {
    let mut new_manager = ParticleManager::new(old.max_part(), old.max_part_bh());

    for (idx, p) in old.particles().iter().enumerate() {
        if !sent[idx] {
            let gas = (p.particle_type() == ParticleType::Gas).then(|| old.gas_slots()[p.pi as usize]);
            let bh = (p.particle_type() == ParticleType::BlackHole).then(|| old.black_hole_slots()[p.pi as usize]);
            new_manager.push(*p, gas, bh)?;
        }
    }

    let mut gas_cursor = 0usize;
    let mut bh_cursor = 0usize;
    for p in received_particles {
        match p.particle_type() {
            ParticleType::Gas => {
                let slot = received_gas[gas_cursor];
                gas_cursor += 1;
                new_manager.push(*p, Some(slot), None)?;
            }
            ParticleType::BlackHole => {
                let slot = received_bh[bh_cursor];
                bh_cursor += 1;
                new_manager.push(*p, None, Some(slot))?;
            }
            _ => {
                new_manager.push(*p, None, None)?;
            }
        }
    }

    Ok(new_manager)
}
