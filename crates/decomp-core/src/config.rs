//! Configuration knobs for the decomposition core (§6).

use serde::{Deserialize, Serialize};

use crate::constants::TOPNODEFACTOR;

/// Tunables supplied by the host simulation. Deserializable from the same
/// JSON parameter files the rest of the program already reads — the core
/// does not parse CLI arguments or files itself, only values handed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of leaf-range segments assigned per rank (`>= 1`). Values
    /// above 1 allow finer work balance at the cost of more segments per
    /// rank to track.
    pub over_decomp: usize,

    /// Initial top-node budget, expressed as a factor of `max_part`.
    pub top_node_alloc_factor: f64,

    /// Slack above the per-rank average particle count allowed before a
    /// split is rejected as violating the memory ceiling.
    pub part_alloc_factor: f64,

    /// Constant in the post-merge leaf-quota formula (§4.3).
    pub topnodefactor: f64,

    /// Hard per-rank bound on resident base particles.
    pub max_part: usize,

    /// Hard per-rank bound on resident black-hole slots.
    pub max_part_bh: usize,

    /// Route all-to-all exchange through synchronous sends instead of
    /// non-blocking isend/irecv pairs — a workaround for transports that
    /// mishandle large non-blocking all-to-all traffic.
    pub no_isend_irecv: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            over_decomp: 1,
            top_node_alloc_factor: 2.0,
            part_alloc_factor: 1.3,
            topnodefactor: TOPNODEFACTOR,
            max_part: 1_000_000,
            max_part_bh: 16_384,
            no_isend_irecv: false,
        }
    }
}

impl Config {
    /// `MaxPart` a rank may hold, including the configured slack above the
    /// average per-rank share of `total_particles` over `n_ranks`.
    pub fn max_part_for(&self, total_particles: usize, n_ranks: usize) -> usize {
        let average = (total_particles as f64) / (n_ranks.max(1) as f64);
        ((average * self.part_alloc_factor).ceil() as usize).max(self.max_part.min(total_particles))
    }

    pub fn initial_top_node_budget(&self) -> usize {
        (self.top_node_alloc_factor * self.max_part as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.over_decomp, cfg.over_decomp);
        assert_eq!(back.max_part, cfg.max_part);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"over_decomp": 4}"#).unwrap();
        assert_eq!(cfg.over_decomp, 4);
        assert_eq!(cfg.max_part, Config::default().max_part);
    }
}
