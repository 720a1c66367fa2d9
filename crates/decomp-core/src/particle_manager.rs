//! Owns the local base/gas/black-hole tables and the invariants that tie
//! them together (§3, §4.2).

use crate::error::{DecompError, Result};
use crate::particle::{forked_id, Particle, ParticleType};
use crate::slots::{BlackHoleSlot, GasSlot};

/// The three tables resident on one rank.
///
/// `fork` is the only way new particles enter a table outside of the
/// exchange engine's receive path; it exists so star formation / black
/// hole seeding code (outside this crate) has one narrow, invariant-
/// checked entry point rather than pushing onto the vectors directly.
pub struct ParticleManager {
    particles: Vec<Particle>,
    gas: Vec<GasSlot>,
    black_holes: Vec<BlackHoleSlot>,
    max_part: usize,
    max_part_bh: usize,
}

impl ParticleManager {
    pub fn new(max_part: usize, max_part_bh: usize) -> Self {
        ParticleManager {
            particles: Vec::new(),
            gas: Vec::new(),
            black_holes: Vec::new(),
            max_part,
            max_part_bh,
        }
    }

    pub fn with_capacity(max_part: usize, max_part_bh: usize, capacity: usize) -> Self {
        let mut m = Self::new(max_part, max_part_bh);
        m.particles.reserve(capacity);
        m
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn max_part(&self) -> usize {
        self.max_part
    }

    pub fn max_part_bh(&self) -> usize {
        self.max_part_bh
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn gas_slots(&self) -> &[GasSlot] {
        &self.gas
    }

    pub fn gas_slots_mut(&mut self) -> &mut [GasSlot] {
        &mut self.gas
    }

    pub fn black_hole_slots(&self) -> &[BlackHoleSlot] {
        &self.black_holes
    }

    pub fn black_hole_slots_mut(&mut self) -> &mut [BlackHoleSlot] {
        &mut self.black_holes
    }

    /// Counts per [`ParticleType`], in tag order.
    pub fn count_by_type(&self) -> [i64; ParticleType::COUNT] {
        let mut counts = [0i64; ParticleType::COUNT];
        for p in &self.particles {
            counts[p.particle_type() as usize] += 1;
        }
        counts
    }

    /// Appends a received or locally constructed particle, assigning its
    /// slot index if it carries auxiliary state. Checks `MaxPart`/
    /// `MaxPartBh` and returns [`DecompError::ParticleTableOverflow`] on
    /// breach rather than silently growing past the configured ceiling.
    ///
    /// Gas particles are inserted at the end of the existing gas prefix
    /// rather than appended, keeping `[0, N_gas_slots)` a dense, type-0-
    /// only prefix of the base table (§4.6 step 6-8's invariant,
    /// maintained here instead of by a separate shift pass so every
    /// caller — fork, the exchange rebuild, tests — gets it for free).
    pub fn push(&mut self, mut particle: Particle, gas: Option<GasSlot>, bh: Option<BlackHoleSlot>) -> Result<usize> {
        if self.particles.len() >= self.max_part {
            return Err(DecompError::ParticleTableOverflow {
                table: "NumPart",
                count: self.particles.len() + 1,
                bound: self.max_part,
            });
        }
        match particle.particle_type() {
            ParticleType::Gas => {
                let slot = gas.expect("gas particle pushed without a GasSlot");
                self.gas.push(slot);
                particle.pi = (self.gas.len() - 1) as i64;
                let insert_at = self.gas.len() - 1;
                self.particles.insert(insert_at, particle);
                Ok(insert_at)
            }
            ParticleType::BlackHole => {
                if self.black_holes.len() >= self.max_part_bh {
                    return Err(DecompError::ParticleTableOverflow {
                        table: "N_bh",
                        count: self.black_holes.len() + 1,
                        bound: self.max_part_bh,
                    });
                }
                let slot = bh.expect("black hole particle pushed without a BlackHoleSlot");
                self.black_holes.push(slot);
                particle.pi = (self.black_holes.len() - 1) as i64;
                self.particles.push(particle);
                Ok(self.particles.len() - 1)
            }
            _ => {
                particle.pi = crate::particle::NO_AUX_INDEX;
                self.particles.push(particle);
                Ok(self.particles.len() - 1)
            }
        }
    }

    /// Number of base entries in the gas prefix `[0, N_gas_slots)`;
    /// always equal to the gas slot table's length since the gas table
    /// is kept dense and in one-to-one correspondence with the prefix.
    pub fn n_gas_slots(&self) -> usize {
        self.gas.len()
    }

    /// Duplicates `parent_index` into a new particle one generation
    /// later, stamping a derived identifier via [`forked_id`]. Used by
    /// star formation / black hole seeding between decompositions; the
    /// fresh copy shares the parent's position and key but starts at
    /// zero mass (§4.2), so it is inert until something outside this
    /// table gives it real mass, and is reclaimed as garbage at the next
    /// collection if nothing does.
    pub fn fork(&mut self, parent_index: usize) -> Result<usize> {
        let parent = self.particles[parent_index];
        if parent.generation == u8::MAX {
            return Err(DecompError::StructuralCorruption {
                detail: format!("particle {} has reached the maximum fork generation", parent.id),
            });
        }
        let mut child = parent;
        child.generation = parent.generation + 1;
        child.id = forked_id(parent.id, child.generation);
        child.mass = 0.0;

        let gas = (parent.particle_type() == ParticleType::Gas)
            .then(|| self.gas[parent.pi as usize]);
        let bh = (parent.particle_type() == ParticleType::BlackHole)
            .then(|| self.black_holes[parent.pi as usize]);

        self.push(child, gas, bh)
    }

    /// Drops every particle with `mass == 0.0`, compacting the table and
    /// the slot tables it references. Called by the garbage collector's
    /// second pass (§4.7); does not itself update cross-references in
    /// the top tree, which is the caller's responsibility.
    pub fn remove_garbage(&mut self) -> usize {
        let before = self.particles.len();
        let mut new_particles = Vec::with_capacity(before);
        let mut new_gas = Vec::with_capacity(self.gas.len());
        let mut new_bh = Vec::with_capacity(self.black_holes.len());

        for mut p in self.particles.drain(..) {
            if p.is_garbage() {
                continue;
            }
            match p.particle_type() {
                ParticleType::Gas => {
                    new_gas.push(self.gas[p.pi as usize]);
                    p.pi = (new_gas.len() - 1) as i64;
                }
                ParticleType::BlackHole => {
                    new_bh.push(self.black_holes[p.pi as usize]);
                    p.pi = (new_bh.len() - 1) as i64;
                }
                _ => {}
            }
            new_particles.push(p);
        }

        let removed = before - new_particles.len();
        self.particles = new_particles;
        self.gas = new_gas;
        self.black_holes = new_bh;
        removed
    }

    /// Validates the table invariants the garbage collector relies on:
    /// every `pi` index in range for its type, no duplicate ids, and the
    /// gas-prefix invariant (§4.6, §4.7: every type-0 base entry *i*
    /// satisfies `i < N_gas_slots`, and nothing else does). Returns
    /// [`DecompError::StructuralCorruption`] on the first violation found.
    pub fn verify_invariants(&self) -> Result<()> {
        use std::collections::HashSet;
        let n_gas_slots = self.n_gas_slots();
        let mut ids = HashSet::with_capacity(self.particles.len());
        for (i, p) in self.particles.iter().enumerate() {
            if !ids.insert(p.id) {
                return Err(DecompError::StructuralCorruption {
                    detail: format!("duplicate particle id {}", p.id),
                });
            }
            let ty = p.particle_type();
            if (ty == ParticleType::Gas) != (i < n_gas_slots) {
                return Err(DecompError::StructuralCorruption {
                    detail: format!(
                        "gas-prefix invariant violated at base index {i}: type {:?}, n_gas_slots {n_gas_slots}",
                        ty
                    ),
                });
            }
            match ty {
                ParticleType::Gas => {
                    if p.pi < 0 || p.pi as usize >= self.gas.len() {
                        return Err(DecompError::StructuralCorruption {
                            detail: format!("gas particle {} has out-of-range pi {}", p.id, p.pi),
                        });
                    }
                }
                ParticleType::BlackHole => {
                    if p.pi < 0 || p.pi as usize >= self.black_holes.len() {
                        return Err(DecompError::StructuralCorruption {
                            detail: format!("black hole particle {} has out-of-range pi {}", p.id, p.pi),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halo_particle(id: u64, key: u64) -> Particle {
        Particle {
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass: 1.0,
            type_tag: ParticleType::Halo as u8,
            id,
            generation: 0,
            timebin: 0,
            grav_cost: 0.0,
            key,
            pi: crate::particle::NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        }
    }

    #[test]
    fn push_respects_max_part() {
        let mut mgr = ParticleManager::new(1, 1);
        mgr.push(halo_particle(1, 0), None, None).unwrap();
        let err = mgr.push(halo_particle(2, 0), None, None).unwrap_err();
        assert!(matches!(err, DecompError::ParticleTableOverflow { table: "NumPart", .. }));
    }

    #[test]
    fn fork_bumps_generation_and_preserves_position() {
        let mut mgr = ParticleManager::new(10, 10);
        let idx = mgr.push(halo_particle(7, 42), None, None).unwrap();
        let child_idx = mgr.fork(idx).unwrap();
        let child = mgr.particles()[child_idx];
        assert_eq!(child.generation, 1);
        assert_eq!(child.key, 42);
        assert_ne!(child.id, mgr.particles()[idx].id);
        assert_eq!(child.mass, 0.0);
        assert!(child.is_garbage());
    }

    #[test]
    fn remove_garbage_compacts_and_relinks_gas_slots() {
        let mut mgr = ParticleManager::new(10, 10);
        let mut gas_particle = halo_particle(1, 0);
        gas_particle.type_tag = ParticleType::Gas as u8;
        mgr.push(gas_particle, Some(GasSlot::default()), None).unwrap();

        let mut dead = halo_particle(2, 0);
        dead.mass = 0.0;
        mgr.push(dead, None, None).unwrap();

        let mut gas_particle_2 = halo_particle(3, 0);
        gas_particle_2.type_tag = ParticleType::Gas as u8;
        mgr.push(gas_particle_2, Some(GasSlot::default()), None).unwrap();

        let removed = mgr.remove_garbage();
        assert_eq!(removed, 1);
        assert_eq!(mgr.len(), 2);
        assert_eq!(mgr.gas_slots().len(), 2);
        mgr.verify_invariants().unwrap();
    }

    #[test]
    fn verify_invariants_catches_duplicate_ids() {
        let mut mgr = ParticleManager::new(10, 10);
        mgr.push(halo_particle(9, 0), None, None).unwrap();
        mgr.push(halo_particle(9, 0), None, None).unwrap();
        assert!(mgr.verify_invariants().is_err());
    }

    #[test]
    fn push_keeps_gas_entries_in_a_dense_base_prefix() {
        let mut mgr = ParticleManager::new(10, 10);
        mgr.push(halo_particle(1, 0), None, None).unwrap();

        let mut gas = halo_particle(2, 0);
        gas.type_tag = ParticleType::Gas as u8;
        mgr.push(gas, Some(GasSlot::default()), None).unwrap();

        mgr.push(halo_particle(3, 0), None, None).unwrap();

        let mut gas2 = halo_particle(4, 0);
        gas2.type_tag = ParticleType::Gas as u8;
        mgr.push(gas2, Some(GasSlot::default()), None).unwrap();

        assert_eq!(mgr.n_gas_slots(), 2);
        for (i, p) in mgr.particles().iter().enumerate() {
            assert_eq!(p.particle_type() == ParticleType::Gas, i < mgr.n_gas_slots());
        }
        mgr.verify_invariants().unwrap();
    }

    #[test]
    fn verify_invariants_catches_a_non_gas_entry_inside_the_gas_prefix() {
        let mut mgr = ParticleManager::new(10, 10);
        let mut gas = halo_particle(1, 0);
        gas.type_tag = ParticleType::Gas as u8;
        mgr.push(gas, Some(GasSlot::default()), None).unwrap();
        mgr.push(halo_particle(2, 0), None, None).unwrap();

        // Smuggle a non-gas entry into the gas prefix without going
        // through `push`, simulating a hypothetical future bug.
        mgr.particles_mut().swap(0, 1);
        assert!(mgr.verify_invariants().is_err());
    }
}
