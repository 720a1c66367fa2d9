//! Garbage collector (§4.7): runs after every exchange to drop
//! particles the simulation has marked dead and keep the auxiliary slot
//! tables consistent with the particle table that references them.
//!
//! Three passes, always in this order:
//!   1. gas reclaim — zero out the hydro state of any gas particle
//!      about to be collected, so a stale density/entropy value can
//!      never be read back by code that still holds the old index.
//!   2. mass-zero elimination — compact the particle table (and, as a
//!      side effect, the gas/black-hole slot tables it indexes into).
//!   3. black-hole compaction — re-stamp `reverse_link` on every
//!      surviving black-hole slot, since compaction just moved particle
//!      indices out from under it.

use tracing::info;

use crate::error::Result;
use crate::particle::ParticleType;
use crate::particle_manager::ParticleManager;

/// Outcome of one collection run, logged at the call site so a rank
/// that collects an unusual fraction of its table stands out in the
/// trace without extra instrumentation at the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionReport {
    pub collected: usize,
    pub remaining: usize,
}

/// Runs all three passes and verifies the resulting tables. Returns
/// `Err` only if [`ParticleManager::verify_invariants`] finds the
/// tables inconsistent afterwards — the passes themselves cannot fail,
/// since they only ever remove rows.
pub fn collect(manager: &mut ParticleManager) -> Result<CollectionReport> {
    reclaim_gas(manager);
    let collected = manager.remove_garbage();
    compact_black_holes(manager);

    manager.verify_invariants()?;

    let report = CollectionReport {
        collected,
        remaining: manager.len(),
    };
    info!(collected = report.collected, remaining = report.remaining, "garbage collection pass complete");
    Ok(report)
}

/// Pass 1: zero the hydro state of every gas particle about to be
/// collected, so nothing downstream can observe a stale value through
/// an index that is about to be reused.
fn reclaim_gas(manager: &mut ParticleManager) {
    let gas_indices: Vec<usize> = manager
        .particles()
        .iter()
        .filter(|p| p.is_garbage() && p.particle_type() == ParticleType::Gas)
        .map(|p| p.pi as usize)
        .collect();
    let slots = manager.gas_slots_mut();
    for idx in gas_indices {
        slots[idx] = crate::slots::GasSlot::default();
    }
}

/// Pass 3: after compaction, every surviving black-hole slot's
/// `reverse_link` is stale (it pointed at a particle index that may
/// have shifted). Walk the particle table once and fix every link.
fn compact_black_holes(manager: &mut ParticleManager) {
    let links: Vec<(usize, usize)> = manager
        .particles()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.particle_type() == ParticleType::BlackHole)
        .map(|(idx, p)| (p.pi as usize, idx))
        .collect();
    let slots = manager_black_hole_slots_mut(manager);
    for (slot_idx, particle_idx) in links {
        slots[slot_idx].reverse_link = particle_idx as i64;
    }
}

fn manager_black_hole_slots_mut(manager: &mut ParticleManager) -> &mut [crate::slots::BlackHoleSlot] {
    manager.black_hole_slots_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::{Particle, ParticleType, NO_AUX_INDEX};
    use crate::slots::BlackHoleSlot;

    fn particle(id: u64, ty: ParticleType, mass: f64) -> Particle {
        Particle {
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass,
            type_tag: ty as u8,
            id,
            generation: 0,
            timebin: 0,
            grav_cost: 0.0,
            key: 0,
            pi: NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        }
    }

    #[test]
    fn collect_drops_mass_zero_particles_and_passes_verification() {
        let mut mgr = ParticleManager::new(10, 10);
        mgr.push(particle(1, ParticleType::Halo, 1.0), None, None).unwrap();
        mgr.push(particle(2, ParticleType::Halo, 0.0), None, None).unwrap();
        let report = collect(&mut mgr).unwrap();
        assert_eq!(report.collected, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(mgr.particles()[0].id, 1);
    }

    #[test]
    fn compact_black_holes_restamps_reverse_link_after_compaction() {
        let mut mgr = ParticleManager::new(10, 10);
        mgr.push(particle(1, ParticleType::Halo, 0.0), None, None).unwrap();
        mgr.push(particle(2, ParticleType::BlackHole, 1.0), None, Some(BlackHoleSlot::default()))
            .unwrap();
        collect(&mut mgr).unwrap();
        assert_eq!(mgr.len(), 1);
        let bh = &mgr.particles()[0];
        assert_eq!(bh.particle_type(), ParticleType::BlackHole);
        assert_eq!(mgr.black_hole_slots()[bh.pi as usize].reverse_link, 0);
    }
}
