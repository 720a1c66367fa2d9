//! Cost/count summarizer (§4.4): attributes every local particle's work
//! to a top-tree leaf, reduces across ranks, then rolls the totals back
//! up through internal nodes so the splitter can compare subtrees of
//! any size in a single lookup.

use mpi::collective::SystemOperation;
use mpi::topology::Communicator;

use crate::particle::Particle;
use crate::top_tree::TopTree;

/// Per-leaf totals, indexed by `leaf_ordinal`.
#[derive(Debug, Clone, Default)]
pub struct LeafTotals {
    pub count: Vec<i64>,
    pub cost: Vec<f64>,
}

/// Accumulates local particle counts and costs into the tree's leaves.
/// Call [`reduce_global`] afterwards to fold in every rank's share
/// before the splitter runs.
pub fn summarize_local(tree: &TopTree, particles: &[Particle]) -> LeafTotals {
    let n_leaves = tree.leaf_count();
    let mut totals = LeafTotals {
        count: vec![0i64; n_leaves],
        cost: vec![0.0f64; n_leaves],
    };
    for p in particles {
        let leaf = tree.find_leaf(p.key);
        debug_assert!(leaf.leaf_ordinal >= 0, "leaf ordinals must be assigned before summarizing");
        let ord = leaf.leaf_ordinal as usize;
        totals.count[ord] += 1;
        totals.cost[ord] += p.work();
    }
    totals
}

/// `MPI_Allreduce(SUM)` across every rank's local [`LeafTotals`], so
/// every rank ends up with the same globally-summed view regardless of
/// how particles happen to be distributed before the decomposition.
pub fn reduce_global<C: Communicator>(world: &C, local: &LeafTotals) -> LeafTotals {
    let mut count = vec![0i64; local.count.len()];
    let mut cost = vec![0.0f64; local.cost.len()];
    world.all_reduce_into(&local.count[..], &mut count[..], SystemOperation::sum());
    world.all_reduce_into(&local.cost[..], &mut cost[..], SystemOperation::sum());
    LeafTotals { count, cost }
}

/// Writes globally-reduced leaf totals back into the tree's leaf nodes,
/// then rolls them up through every internal node bottom-up so a
/// subtree rooted anywhere carries the sum of its leaves.
pub fn apply_totals(tree: &mut TopTree, totals: &LeafTotals) {
    for node in tree.nodes.iter_mut() {
        if node.is_leaf() {
            let ord = node.leaf_ordinal as usize;
            node.count = totals.count[ord];
            node.cost = totals.cost[ord];
        }
    }
    roll_up(tree, 0);
}

fn roll_up(tree: &mut TopTree, idx: usize) -> (i64, f64) {
    if tree.nodes[idx].is_leaf() {
        return (tree.nodes[idx].count, tree.nodes[idx].cost);
    }
    let first = tree.nodes[idx].first_daughter as usize;
    let mut count = 0i64;
    let mut cost = 0.0f64;
    for c in 0..8 {
        let (cc, cs) = roll_up(tree, first + c);
        count += cc;
        cost += cs;
    }
    tree.nodes[idx].count = count;
    tree.nodes[idx].cost = cost;
    (count, cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::top_tree::build_local;

    fn halo(key: u64, grav_cost: f32) -> Particle {
        Particle {
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass: 1.0,
            type_tag: crate::particle::ParticleType::Halo as u8,
            id: key,
            generation: 0,
            timebin: 0,
            grav_cost,
            key,
            pi: crate::particle::NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        }
    }

    #[test]
    fn summarize_local_attributes_every_particle_to_some_leaf() {
        let mut tree = build_local(&[(10, 1.0), (20, 2.0), (30, 0.0)], 1000).unwrap();
        tree.assign_leaf_ordinals();
        let particles = vec![halo(10, 1.0), halo(20, 2.0), halo(30, 0.0)];
        let totals = summarize_local(&tree, &particles);
        let total_count: i64 = totals.count.iter().sum();
        assert_eq!(total_count, 3);
    }

    #[test]
    fn apply_totals_rolls_up_through_internal_nodes() {
        let keyed_costs: Vec<(u64, f64)> = (0..200u64).map(|k| (k, 1.0)).collect();
        let mut tree = build_local(&keyed_costs, 10_000).unwrap();
        tree.assign_leaf_ordinals();
        let particles: Vec<Particle> = (0..200u64).map(|k| halo(k, 0.0)).collect();
        let local = summarize_local(&tree, &particles);
        apply_totals(&mut tree, &local);
        assert_eq!(tree.nodes[0].count, 200);
    }
}
