//! Particle exchange engine (§4.6): moves particles (and their gas/
//! black-hole auxiliary state) from where they currently sit to the
//! rank the splitter just assigned them to.
//!
//! The protocol runs in three passes, each a paired pre-exchange of
//! counts followed by an `Alltoallv` of payload, mirroring the
//! handshake-then-payload idiom the teacher crate uses for its
//! rank-to-rank point transfers: base particles first, then gas slots
//! for whichever base particles were gas, then black-hole slots the
//! same way.

use mpi::datatype::{Equivalence, Partition, PartitionMut};
use mpi::topology::Communicator;
use mpi::Count;

use crate::constants::MAX_SHEDDING_ITERATIONS;
use crate::error::{DecompError, Result};
use crate::particle::{Particle, ParticleType};
use crate::splitter::{rank_for_leaf, RankRange};
use crate::top_tree::TopTree;

/// Message tags for the handshake/payload pairs this engine sends.
/// Kept as plain constants rather than an enum because `mpi::Tag` is a
/// bare integer type and every send/receive pair here needs to agree
/// on the same value without a conversion step.
pub mod tag {
    use mpi::Tag;
    pub const BASE_PAYLOAD: Tag = 10;
    pub const GAS_PAYLOAD: Tag = 11;
    pub const BLACKHOLE_PAYLOAD: Tag = 12;
}

/// For every local particle, the rank owning the top-tree leaf its key
/// falls in.
pub fn target_ranks(particles: &[Particle], tree: &TopTree, ranges: &[RankRange]) -> Vec<i32> {
    particles
        .iter()
        .map(|p| {
            let leaf = tree.find_leaf(p.key);
            rank_for_leaf(ranges, leaf.leaf_ordinal as usize)
        })
        .collect()
}

/// `toGo[r]`: how many local particles are bound for rank `r`.
pub fn to_go_counts(targets: &[i32], n_ranks: usize) -> Vec<i32> {
    let mut counts = vec![0i32; n_ranks];
    for &r in targets {
        counts[r as usize] += 1;
    }
    counts
}

/// Builds the full `n_ranks x n_ranks` toGo matrix by gathering every
/// rank's row. `my_row` is this rank's own `toGo` vector.
pub fn gather_matrix<C: Communicator>(world: &C, my_row: &[i32], n_ranks: usize) -> Vec<Vec<i32>> {
    let mut flat = vec![0i32; n_ranks * n_ranks];
    world.all_gather_into(my_row, &mut flat[..]);
    flat.chunks(n_ranks).map(|row| row.to_vec()).collect()
}

/// Round-robin shedding (§4.6, §7): while any rank's projected post-
/// exchange total would exceed `max_part`, deterministically reduce
/// the heaviest-overflow column's entries one at a time, cycling
/// senders, until every rank fits. A column's sum over every sender —
/// including the sender's own diagonal entry, the particles already on
/// that rank which never needed to move — is exactly the rank's total
/// after this round, so no separate resident count is threaded through.
/// Every rank runs this over the same gathered matrix and so reaches
/// the same result without further communication. Shed entries are not
/// exported this round; [`super::decomposition`] keeps the
/// corresponding particles resident and runs another round.
pub fn shed_overflow(matrix: &mut [Vec<i32>], max_part: usize) -> Result<u32> {
    let n_ranks = matrix.len();
    let mut iterations = 0u32;

    loop {
        let projected: Vec<i64> = (0..n_ranks)
            .map(|dest| matrix.iter().map(|row| row[dest] as i64).sum::<i64>())
            .collect();

        let overflowing: Vec<usize> = (0..n_ranks).filter(|&d| projected[d] as usize > max_part).collect();
        if overflowing.is_empty() {
            return Ok(iterations);
        }
        if iterations >= MAX_SHEDDING_ITERATIONS {
            return Err(DecompError::ExchangeSheddingExhausted { iterations });
        }

        for dest in overflowing {
            let mut excess = projected[dest] as usize - max_part;
            let mut sender = (iterations as usize) % n_ranks;
            let mut spins = 0usize;
            while excess > 0 && spins < n_ranks * n_ranks {
                if matrix[sender][dest] > 0 {
                    matrix[sender][dest] -= 1;
                    excess -= 1;
                }
                sender = (sender + 1) % n_ranks;
                spins += 1;
            }
        }
        iterations += 1;
    }
}

/// The send/recv counts this rank uses for the payload `Alltoallv`
/// calls, derived from the (possibly shed) toGo matrix.
pub struct ExchangePlan {
    pub send_counts: Vec<i32>,
    pub recv_counts: Vec<i32>,
}

impl ExchangePlan {
    pub fn from_matrix(matrix: &[Vec<i32>], my_rank: usize) -> Self {
        let n_ranks = matrix.len();
        let send_counts = matrix[my_rank].clone();
        let recv_counts: Vec<i32> = (0..n_ranks).map(|src| matrix[src][my_rank]).collect();
        ExchangePlan { send_counts, recv_counts }
    }
}

fn displacements(counts: &[i32]) -> Vec<Count> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut running: Count = 0;
    for &c in counts {
        displs.push(running);
        running += c as Count;
    }
    displs
}

/// Groups the first `send_counts[dest]` local particles targeting each
/// destination into a contiguous per-destination buffer, in local
/// order, matching the layout `Alltoallv` expects from `send_counts`/
/// displacements. `send_counts` may be below the naive `toGo` tally for
/// some destination (shedding, §4.6 step 4): the excess particles for
/// that destination are left out of the buffer, and the returned mask
/// marks which input particles were included so the caller can keep
/// the rest resident for another round.
pub fn pack_by_target(particles: &[Particle], targets: &[i32], send_counts: &[i32]) -> (Vec<Particle>, Vec<bool>) {
    let total_send: i32 = send_counts.iter().sum();
    let displs = displacements(send_counts);
    let mut cursor = displs.clone();
    let mut remaining = send_counts.to_vec();
    let mut out = vec![Particle::default(); total_send as usize];
    let mut sent = vec![false; particles.len()];
    for (i, (p, &dest)) in particles.iter().zip(targets.iter()).enumerate() {
        let d = dest as usize;
        if remaining[d] > 0 {
            let slot = cursor[d] as usize;
            out[slot] = *p;
            cursor[d] += 1;
            remaining[d] -= 1;
            sent[i] = true;
        }
    }
    (out, sent)
}

/// Runs the base-particle `Alltoallv` given a finished plan and a
/// rank-ordered send buffer, returning the particles received from
/// every other rank (order: all particles from rank 0, then rank 1,
/// and so on). `synchronous` routes around the collective via
/// [`exchange_varcount_synchronous`] instead (§6 `NO_ISEND_IRECV`),
/// for transports that mishandle large non-blocking all-to-all traffic.
pub fn exchange_particles<C: Communicator>(world: &C, plan: &ExchangePlan, send_buf: &[Particle], synchronous: bool) -> Vec<Particle> {
    if synchronous {
        return exchange_varcount_synchronous(world, &plan.send_counts, &plan.recv_counts, send_buf);
    }
    let send_displs = displacements(&plan.send_counts);
    let recv_displs = displacements(&plan.recv_counts);
    let recv_total: i32 = plan.recv_counts.iter().sum();
    let mut recv_buf = vec![Particle::default(); recv_total as usize];

    let send_partition = Partition::new(send_buf, plan.send_counts.clone(), send_displs);
    let mut recv_partition = PartitionMut::new(&mut recv_buf[..], plan.recv_counts.clone(), recv_displs);
    world.all_to_all_varcount_into(&send_partition, &mut recv_partition);
    recv_buf
}

/// Same shape as [`exchange_particles`] but for a slot table; the
/// caller is responsible for packing exactly the slots belonging to
/// the particles of the matching type, in the same rank order as the
/// base exchange so the two recombine positionally.
pub fn exchange_slots<C: Communicator, T: Copy + Default + Equivalence>(
    world: &C,
    send_counts: &[i32],
    recv_counts: &[i32],
    send_buf: &[T],
    synchronous: bool,
) -> Vec<T> {
    if synchronous {
        return exchange_varcount_synchronous(world, send_counts, recv_counts, send_buf);
    }
    let send_displs = displacements(send_counts);
    let recv_displs = displacements(recv_counts);
    let recv_total: i32 = recv_counts.iter().sum();
    let mut recv_buf = vec![T::default(); recv_total as usize];

    let send_partition = Partition::new(send_buf, send_counts.to_vec(), send_displs);
    let mut recv_partition = PartitionMut::new(&mut recv_buf[..], recv_counts.to_vec(), recv_displs);
    world.all_to_all_varcount_into(&send_partition, &mut recv_partition);
    recv_buf
}

/// `NO_ISEND_IRECV` fallback (§6): instead of handing the whole
/// variable-count all-to-all to the library's collective — which is
/// free to implement it with non-blocking isend/irecv pairs under the
/// hood — walk every ordered rank pair once and exchange with it
/// directly via a blocking `send`/`receive_into`, low rank sending
/// first and high rank receiving first so the pattern can never
/// deadlock, the same low/high-rank ordering
/// [`super::decomposition::DecompositionContext::merge_global`] uses
/// for its pairwise top-tree merge.
fn exchange_varcount_synchronous<C: Communicator, T: Copy + Default + Equivalence>(
    world: &C,
    send_counts: &[i32],
    recv_counts: &[i32],
    send_buf: &[T],
) -> Vec<T> {
    let n_ranks = send_counts.len();
    let my_rank = world.rank() as usize;
    let send_displs = displacements(send_counts);
    let recv_displs = displacements(recv_counts);
    let recv_total: i32 = recv_counts.iter().sum();
    let mut recv_buf = vec![T::default(); recv_total as usize];

    let my_send_start = send_displs[my_rank] as usize;
    let my_send_len = send_counts[my_rank] as usize;
    let my_recv_start = recv_displs[my_rank] as usize;
    let my_recv_len = recv_counts[my_rank] as usize;
    recv_buf[my_recv_start..my_recv_start + my_recv_len]
        .copy_from_slice(&send_buf[my_send_start..my_send_start + my_send_len]);

    for other in 0..n_ranks {
        if other == my_rank {
            continue;
        }
        let send_start = send_displs[other] as usize;
        let send_len = send_counts[other] as usize;
        let recv_start = recv_displs[other] as usize;
        let recv_len = recv_counts[other] as usize;
        let partner = world.process_at_rank(other as i32);
        let chunk = &send_buf[send_start..send_start + send_len];
        let mut incoming = vec![T::default(); recv_len];
        if my_rank < other {
            partner.send(chunk);
            partner.receive_into(&mut incoming[..]);
        } else {
            partner.receive_into(&mut incoming[..]);
            partner.send(chunk);
        }
        recv_buf[recv_start..recv_start + recv_len].copy_from_slice(&incoming);
    }
    recv_buf
}

/// Tallies the per-destination `toGoSph`/`toGoBh` counts: particles of
/// type `ty` among exactly the ones `pack_by_target`'s `sent` mask
/// included, so a shed particle's auxiliary slot is never exported
/// without its base entry.
pub fn aux_send_counts(particles: &[Particle], targets: &[i32], sent: &[bool], n_ranks: usize, ty: ParticleType) -> Vec<i32> {
    let mut counts = vec![0i32; n_ranks];
    for ((p, &dest), &is_sent) in particles.iter().zip(targets.iter()).zip(sent.iter()) {
        if is_sent && p.particle_type() == ty {
            counts[dest as usize] += 1;
        }
    }
    counts
}

/// Packs the auxiliary slots belonging to outgoing particles of type
/// `ty`, following the same `sent` inclusion decision and per-
/// destination order [`pack_by_target`] used for the base buffer, so
/// the two recombine positionally once both land on the receiving
/// rank.
pub fn pack_aux_slots<T: Copy + Default>(
    particles: &[Particle],
    targets: &[i32],
    sent: &[bool],
    slots: &[T],
    ty: ParticleType,
    send_counts: &[i32],
) -> Vec<T> {
    let total_send: i32 = send_counts.iter().sum();
    let displs = displacements(send_counts);
    let mut cursor = displs.clone();
    let mut out = vec![T::default(); total_send as usize];
    for ((p, &dest), &is_sent) in particles.iter().zip(targets.iter()).zip(sent.iter()) {
        if is_sent && p.particle_type() == ty {
            let d = dest as usize;
            let slot = cursor[d] as usize;
            out[slot] = slots[p.pi as usize];
            cursor[d] += 1;
        }
    }
    out
}

/// After the base, gas, and black-hole exchanges land, every received
/// particle's `pi` must be rewritten to index into the *local*,
/// freshly-appended slot tables rather than whatever index it carried
/// on its sending rank. `base_gas_index`/`base_bh_index` are the
/// lengths of the local slot tables before this round's receipts were
/// appended; gas/black-hole particles are assumed appended to those
/// tables in the same relative order they appear in `received`.
pub fn relink_pi(received: &mut [Particle], base_gas_index: i64, base_bh_index: i64) {
    let mut next_gas = base_gas_index;
    let mut next_bh = base_bh_index;
    for p in received.iter_mut() {
        match p.particle_type() {
            ParticleType::Gas => {
                p.pi = next_gas;
                next_gas += 1;
            }
            ParticleType::BlackHole => {
                p.pi = next_bh;
                next_bh += 1;
            }
            _ => p.pi = crate::particle::NO_AUX_INDEX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_go_counts_tallies_every_target() {
        let targets = vec![0, 1, 1, 2, 0];
        let counts = to_go_counts(&targets, 3);
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn shed_overflow_reduces_inbound_total_below_ceiling() {
        let mut matrix = vec![vec![5, 5], vec![5, 5]];
        let iterations = shed_overflow(&mut matrix, 6).unwrap();
        assert!(iterations <= MAX_SHEDDING_ITERATIONS);
        for dest in 0..2 {
            let total: i32 = matrix.iter().map(|row| row[dest]).sum();
            assert!(total as usize <= 6);
        }
    }

    #[test]
    fn shed_overflow_is_a_no_op_when_nothing_overflows() {
        let mut matrix = vec![vec![1, 1], vec![1, 1]];
        let iterations = shed_overflow(&mut matrix, 100).unwrap();
        assert_eq!(iterations, 0);
    }

    #[test]
    fn exchange_plan_transposes_the_matrix_for_recv_counts() {
        let matrix = vec![vec![1, 2], vec![3, 4]];
        let plan = ExchangePlan::from_matrix(&matrix, 1);
        assert_eq!(plan.send_counts, vec![3, 4]);
        assert_eq!(plan.recv_counts, vec![2, 4]);
    }

    #[test]
    fn aux_send_counts_only_tallies_the_matching_sent_type() {
        let mut particles = vec![Particle::default(); 3];
        for p in particles.iter_mut() {
            p.mass = 1.0;
        }
        particles[1].type_tag = ParticleType::Gas as u8;
        let targets = vec![0, 1, 0];
        let sent = vec![true, true, true];
        let counts = aux_send_counts(&particles, &targets, &sent, 2, ParticleType::Gas);
        assert_eq!(counts, vec![0, 1]);
    }

    #[test]
    fn aux_send_counts_excludes_shed_particles() {
        let mut particles = vec![Particle::default(); 2];
        particles[0].type_tag = ParticleType::Gas as u8;
        particles[1].type_tag = ParticleType::Gas as u8;
        let targets = vec![1, 1];
        let sent = vec![true, false];
        let counts = aux_send_counts(&particles, &targets, &sent, 2, ParticleType::Gas);
        assert_eq!(counts, vec![0, 1]);
    }

    #[test]
    fn pack_by_target_groups_particles_contiguously_per_destination() {
        let mut particles = vec![Particle::default(); 4];
        for (i, p) in particles.iter_mut().enumerate() {
            p.mass = 1.0;
            p.id = i as u64;
        }
        let targets = vec![1, 0, 1, 0];
        let send_counts = to_go_counts(&targets, 2);
        let (packed, sent) = pack_by_target(&particles, &targets, &send_counts);
        assert_eq!(packed[0].id, 1);
        assert_eq!(packed[1].id, 3);
        assert_eq!(packed[2].id, 0);
        assert_eq!(packed[3].id, 2);
        assert_eq!(sent, vec![true, true, true, true]);
    }

    #[test]
    fn pack_by_target_leaves_out_shed_excess() {
        let mut particles = vec![Particle::default(); 3];
        for (i, p) in particles.iter_mut().enumerate() {
            p.mass = 1.0;
            p.id = i as u64;
        }
        let targets = vec![1, 1, 1];
        // Only room for one of the three on rank 1.
        let send_counts = vec![0, 1];
        let (packed, sent) = pack_by_target(&particles, &targets, &send_counts);
        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].id, 0);
        assert_eq!(sent, vec![true, false, false]);
    }

    #[test]
    fn relink_pi_assigns_sequential_local_indices() {
        let mut received = vec![Particle::default(); 2];
        received[0].type_tag = ParticleType::Gas as u8;
        received[1].type_tag = ParticleType::Gas as u8;
        relink_pi(&mut received, 5, 0);
        assert_eq!(received[0].pi, 5);
        assert_eq!(received[1].pi, 6);
    }
}
