//! Splitter & assigner (§4.5): cuts the ordered sequence of top-tree
//! leaves into `OverDecomp * NTask` contiguous segments, balancing total
//! work first and falling back to balancing raw particle count when the
//! work-balanced cut would overflow a rank's memory ceiling, then pairs
//! segments down onto the `NTask` ranks so each rank's share stays close
//! to the mean even though no single contiguous leaf range would do it.

use crate::error::{DecompError, Result};
use crate::top_tree::TopTree;

/// One contiguous slice of leaves, identified by ordinal range
/// `[first_leaf, first_leaf + leaf_count)`, assigned to `rank`. A rank
/// owns `OverDecomp` of these once the assigner has run, not
/// necessarily adjacent to one another in leaf-ordinal space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankRange {
    pub first_leaf: usize,
    pub leaf_count: usize,
    pub rank: usize,
}

/// Per-leaf cost and count, indexed by `leaf_ordinal` — the same shape
/// produced by [`crate::summarizer::apply_totals`], read back out of the
/// tree so the splitter doesn't need to walk it again.
pub fn leaf_metrics(tree: &TopTree) -> (Vec<f64>, Vec<i64>) {
    let n = tree.leaf_count();
    let mut cost = vec![0.0f64; n];
    let mut count = vec![0i64; n];
    for node in tree.nodes.iter().filter(|n| n.is_leaf()) {
        let ord = node.leaf_ordinal as usize;
        cost[ord] = node.cost;
        count[ord] = node.count;
    }
    (cost, count)
}

/// Greedy prefix-sum split of `metric` (in leaf-ordinal order) into
/// `ncpu` contiguous, non-empty-where-possible segments whose running
/// totals track `total/ncpu` as closely as a single forward pass
/// allows. The last segment absorbs whatever remains. Segments start
/// out tagged with their own index as a placeholder `rank`; the
/// assigner overwrites that once it has paired them down onto the
/// actual task count.
fn split_by_metric(metric: &[f64], ncpu: usize) -> Vec<RankRange> {
    let total: f64 = metric.iter().sum();
    let target = if ncpu == 0 { total } else { total / ncpu as f64 };

    let mut segments = Vec::with_capacity(ncpu);
    let mut leaf = 0usize;
    let mut running = 0.0f64;

    for seg in 0..ncpu {
        let first_leaf = leaf;
        if seg == ncpu - 1 {
            leaf = metric.len();
        } else {
            let cutoff = target * (seg + 1) as f64;
            while leaf < metric.len() && running < cutoff {
                running += metric[leaf];
                leaf += 1;
            }
            // Always leave at least one leaf per remaining segment.
            let remaining_segments = ncpu - seg - 1;
            leaf = leaf.min(metric.len().saturating_sub(remaining_segments));
            leaf = leaf.max(first_leaf);
        }
        segments.push(RankRange {
            first_leaf,
            leaf_count: leaf - first_leaf,
            rank: seg,
        });
    }
    segments
}

fn segment_load(metric: &[f64], seg: &RankRange) -> f64 {
    metric[seg.first_leaf..seg.first_leaf + seg.leaf_count].iter().sum()
}

/// Pair-down assigner (§4.5): starts with one bucket per segment and,
/// while there are more buckets than tasks, sorts buckets by current
/// load ascending and redirects the lightest/heaviest pair `(i,
/// ndomain-1-i)` onto a single new bucket `i`, halving the bucket
/// count. Repeated until exactly `n_tasks` buckets remain, each (absent
/// a non-power-of-two `OverDecomp`) owning `OverDecomp` segments whose
/// combined load sits within a small constant factor of the mean. If
/// halving would ever undershoot `n_tasks` (only possible when `ncpu /
/// n_tasks` isn't a power of two), a round pairs down only as many
/// buckets as needed to land exactly on `n_tasks` instead of a clean
/// halving, rather than overshoot past it.
fn pair_down(segments: &[RankRange], metric: &[f64], n_tasks: usize) -> Vec<RankRange> {
    let ncpu = segments.len();
    let loads: Vec<f64> = segments.iter().map(|s| segment_load(metric, s)).collect();
    let mut bucket_of: Vec<usize> = (0..ncpu).collect();
    let mut ndomain = ncpu;

    while ndomain > n_tasks {
        let mut bucket_loads = vec![0.0f64; ndomain];
        for (seg, &bucket) in bucket_of.iter().enumerate() {
            bucket_loads[bucket] += loads[seg];
        }
        let mut order: Vec<usize> = (0..ndomain).collect();
        order.sort_by(|&a, &b| bucket_loads[a].partial_cmp(&bucket_loads[b]).unwrap());

        // Halve as usual (rounding up, so an odd bucket in the middle is
        // left untouched rather than unpaired), but never undershoot
        // `n_tasks`: for `ncpu / n_tasks` ratios that aren't a power of
        // two, a plain halving can drop below `n_tasks` in one step.
        let new_ndomain = ((ndomain + 1) / 2).max(n_tasks);
        let pairs = ndomain - new_ndomain;

        let mut remap = vec![usize::MAX; ndomain];
        for k in 0..pairs {
            remap[order[k]] = k;
            remap[order[ndomain - 1 - k]] = k;
        }
        let mut next = pairs;
        for &idx in &order[pairs..ndomain - pairs] {
            remap[idx] = next;
            next += 1;
        }

        for bucket in bucket_of.iter_mut() {
            *bucket = remap[*bucket];
        }
        ndomain = new_ndomain;
    }

    let mut out: Vec<RankRange> = segments
        .iter()
        .zip(bucket_of.iter())
        .map(|(s, &rank)| RankRange {
            first_leaf: s.first_leaf,
            leaf_count: s.leaf_count,
            rank,
        })
        .collect();
    out.sort_by_key(|s| s.rank);
    out
}

fn projected_counts_by_rank(ranges: &[RankRange], count: &[i64], n_tasks: usize) -> Vec<i64> {
    let mut totals = vec![0i64; n_tasks];
    for r in ranges {
        totals[r.rank] += count[r.first_leaf..r.first_leaf + r.leaf_count].iter().sum::<i64>();
    }
    totals
}

/// Produces a work-balanced split into `over_decomp * n_tasks` segments
/// paired down onto `n_tasks` ranks, falling back to a load-balanced
/// (count-balanced) split if the work-balanced one would push any
/// rank's combined segments past `max_part`. Returns
/// [`DecompError::MemoryCeilingExceeded`] if even the load-balanced
/// fallback overflows — the caller is expected to treat this as a
/// larger top-tree budget problem and retry with a finer top tree
/// (§4.3, §7).
pub fn split(tree: &TopTree, n_tasks: usize, over_decomp: usize, max_part: usize) -> Result<Vec<RankRange>> {
    let (cost, count) = leaf_metrics(tree);
    let count_f: Vec<f64> = count.iter().map(|&c| c as f64).collect();
    let ncpu = over_decomp.max(1) * n_tasks.max(1);

    let work_segments = split_by_metric(&cost, ncpu);
    let work_assigned = pair_down(&work_segments, &cost, n_tasks);
    let projected = projected_counts_by_rank(&work_assigned, &count, n_tasks);
    if let Some((rank, &projected_count)) = projected
        .iter()
        .enumerate()
        .find(|&(_, &c)| c as usize > max_part)
    {
        let load_segments = split_by_metric(&count_f, ncpu);
        let load_assigned = pair_down(&load_segments, &count_f, n_tasks);
        let projected2 = projected_counts_by_rank(&load_assigned, &count, n_tasks);
        if let Some((rank2, &p2)) = projected2.iter().enumerate().find(|&(_, &c)| c as usize > max_part) {
            return Err(DecompError::MemoryCeilingExceeded {
                rank: rank2 as i32,
                projected: p2 as usize,
                ceiling: max_part,
            });
        }
        tracing::warn!(rank, projected_count, max_part, "falling back to load-balanced split");
        return Ok(load_assigned);
    }
    Ok(work_assigned)
}

/// Maps a Peano key to the owning rank given a split, by locating the
/// leaf ordinal the key falls in and then whichever (possibly
/// non-contiguous) segment contains that ordinal. Used after splitting
/// to tag particles `will_export` against their new owner (§4.6).
pub fn rank_for_leaf(ranges: &[RankRange], leaf_ordinal: usize) -> i32 {
    for range in ranges {
        if leaf_ordinal >= range.first_leaf && leaf_ordinal < range.first_leaf + range.leaf_count {
            return range.rank as i32;
        }
    }
    ranges.last().map(|r| r.rank as i32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_by_metric_covers_every_leaf_exactly_once() {
        let metric = vec![10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0];
        let segments = split_by_metric(&metric, 4);
        let total: usize = segments.iter().map(|r| r.leaf_count).sum();
        assert_eq!(total, metric.len());
        let mut expected_next = 0;
        for r in &segments {
            assert_eq!(r.first_leaf, expected_next);
            expected_next += r.leaf_count;
        }
    }

    #[test]
    fn split_by_metric_balances_evenly_distributed_work() {
        let metric = vec![1.0; 16];
        let segments = split_by_metric(&metric, 4);
        for r in &segments {
            assert_eq!(r.leaf_count, 4);
        }
    }

    #[test]
    fn rank_for_leaf_finds_the_owning_range() {
        let ranges = vec![
            RankRange { first_leaf: 0, leaf_count: 2, rank: 0 },
            RankRange { first_leaf: 2, leaf_count: 3, rank: 1 },
        ];
        assert_eq!(rank_for_leaf(&ranges, 0), 0);
        assert_eq!(rank_for_leaf(&ranges, 2), 1);
        assert_eq!(rank_for_leaf(&ranges, 4), 1);
    }

    #[test]
    fn pair_down_halves_to_exactly_n_tasks_for_power_of_two_over_decomp() {
        // 4 tasks, OverDecomp = 2 -> 8 segments pairing down to 4 ranks.
        let metric = vec![1.0; 8];
        let segments = split_by_metric(&metric, 8);
        let assigned = pair_down(&segments, &metric, 4);
        assert_eq!(assigned.len(), 8);
        let mut per_rank = vec![0usize; 4];
        for r in &assigned {
            per_rank[r.rank] += 1;
        }
        assert_eq!(per_rank, vec![2, 2, 2, 2]);
    }

    #[test]
    fn pair_down_is_identity_when_over_decomp_is_one() {
        let metric = vec![3.0, 1.0, 2.0, 4.0];
        let segments = split_by_metric(&metric, 4);
        let assigned = pair_down(&segments, &metric, 4);
        let mut ranks: Vec<usize> = assigned.iter().map(|s| s.rank).collect();
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn split_over_decomposes_each_rank_into_several_segments() {
        let tree = crate::top_tree::build_local(
            &(0..800u64).map(|k| (k * (crate::constants::PEANOCELLS / 800), 1.0)).collect::<Vec<_>>(),
            10_000,
        )
        .unwrap();
        let mut tree = tree;
        tree.assign_leaf_ordinals();
        let (cost, count) = leaf_metrics(&tree);
        assert!(tree.leaf_count() >= 8, "test needs enough leaves to over-decompose");
        let _ = (cost, count);

        let ranges = split(&tree, 2, 4, usize::MAX).unwrap();
        let mut per_rank = std::collections::HashMap::new();
        for r in &ranges {
            *per_rank.entry(r.rank).or_insert(0usize) += 1;
        }
        assert_eq!(per_rank.len(), 2);
        for count in per_rank.values() {
            assert_eq!(*count, 4, "each of 2 ranks should own OverDecomp=4 segments");
        }
    }
}
