//! The base particle table entry (§3 Data Model).

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};
use serde::{Deserialize, Serialize};

use crate::constants::KeyType;
use crate::domain::Domain;
use crate::peano::{PeanoKey, PositionType};

/// Particle type tag. Six categories, matching the conventional numbering
/// used throughout this lineage of N-body codes (see SPEC_FULL §3.1):
/// gas carries a [`crate::gas::GasSlot`], black holes carry a
/// [`crate::blackhole::BlackHoleSlot`]; halo/disk/bulge/star particles
/// have no auxiliary slot and carry the tag through decomposition
/// unexamined.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleType {
    Gas = 0,
    Halo = 1,
    Disk = 2,
    Bulge = 3,
    Star = 4,
    BlackHole = 5,
}

impl ParticleType {
    pub const COUNT: usize = 6;

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ParticleType::Gas,
            1 => ParticleType::Halo,
            2 => ParticleType::Disk,
            3 => ParticleType::Bulge,
            4 => ParticleType::Star,
            5 => ParticleType::BlackHole,
            other => panic!("invalid particle type tag {other}"),
        }
    }

    pub fn has_auxiliary_slot(&self) -> bool {
        matches!(self, ParticleType::Gas | ParticleType::BlackHole)
    }
}

/// Sentinel `PI` value for particles with no auxiliary slot.
pub const NO_AUX_INDEX: i64 = -1;

/// A base particle table entry.
///
/// `#[repr(C)]` with a flat layout so it can be sent directly through MPI
/// via the hand-built [`Equivalence`] impl below, the same technique the
/// teacher crate uses for `Point`/`Domain`/`MortonKey`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Particle {
    pub position: [PositionType; 3],
    pub velocity: [PositionType; 3],
    pub mass: f64,
    pub type_tag: u8,
    pub id: u64,
    pub generation: u8,
    pub timebin: i32,
    pub grav_cost: f32,
    pub key: KeyType,
    /// Index into the gas or black-hole slot table; meaningful only when
    /// `particle_type().has_auxiliary_slot()`.
    pub pi: i64,
    pub on_another_domain: bool,
    pub will_export: bool,
}

impl Default for Particle {
    /// A zero-mass placeholder used to pre-size receive buffers before
    /// an `Alltoallv` overwrites every slot; never a real particle, so
    /// `is_garbage` holds for any leftover slot a short recv count
    /// didn't fill.
    fn default() -> Self {
        Particle {
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass: 0.0,
            type_tag: ParticleType::Halo as u8,
            id: 0,
            generation: 0,
            timebin: 0,
            grav_cost: 0.0,
            key: 0,
            pi: NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        }
    }
}

impl Particle {
    pub fn particle_type(&self) -> ParticleType {
        ParticleType::from_u8(self.type_tag)
    }

    pub fn is_garbage(&self) -> bool {
        self.mass == 0.0
    }

    /// Recomputes `key` from `position` against `domain`. Called once
    /// at the start of every decomposition before the top tree is built
    /// (§2); the key is otherwise cached between decompositions so nothing
    /// else needs to re-derive it on every lookup.
    pub fn assign_key(&mut self, domain: &Domain) {
        self.key = PeanoKey::from_position(&self.position, domain).key;
    }

    /// `(1 + GravCost) / 2^TimeBin`, falling back to `/TIMEBASE` when
    /// `TimeBin == 0` (§4.4).
    pub fn work(&self) -> f64 {
        let numerator = 1.0 + self.grav_cost as f64;
        if self.timebin == 0 {
            numerator / crate::constants::TIMEBASE as f64
        } else {
            numerator / (2f64).powi(self.timebin)
        }
    }
}

unsafe impl Equivalence for Particle {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
            &[
                offset_of!(Particle, position) as Address,
                offset_of!(Particle, velocity) as Address,
                offset_of!(Particle, mass) as Address,
                offset_of!(Particle, type_tag) as Address,
                offset_of!(Particle, id) as Address,
                offset_of!(Particle, generation) as Address,
                offset_of!(Particle, timebin) as Address,
                offset_of!(Particle, grav_cost) as Address,
                offset_of!(Particle, key) as Address,
                offset_of!(Particle, pi) as Address,
                offset_of!(Particle, on_another_domain) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(3, &PositionType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(3, &PositionType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u8::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u8::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i32::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &f32::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &KeyType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &bool::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

/// Construct a new particle identifier for a fork's child: the low 56
/// bits carry the parent's original identifier, the high 8 bits carry
/// the new generation (§4.2, §8 scenario S5).
pub fn forked_id(parent_id: u64, child_generation: u8) -> u64 {
    (parent_id & 0x00FF_FFFF_FFFF_FFFF) | ((child_generation as u64) << 56)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forked_id_stamps_generation_into_high_byte() {
        let parent = 0x00AB_CDEF_0000_1234u64;
        let child = forked_id(parent, 1);
        assert_eq!(child, (parent & 0x00FF_FFFF_FFFF_FFFF) | (1u64 << 56));
    }

    #[test]
    fn work_falls_back_to_timebase_at_timebin_zero() {
        let p = Particle {
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass: 1.0,
            type_tag: ParticleType::Halo as u8,
            id: 1,
            generation: 0,
            timebin: 0,
            grav_cost: 3.0,
            key: 0,
            pi: NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        };
        assert_eq!(p.work(), 4.0 / crate::constants::TIMEBASE as f64);
    }

    #[test]
    fn work_halves_per_timebin() {
        let mut p = Particle {
            position: [0.0; 3],
            velocity: [0.0; 3],
            mass: 1.0,
            type_tag: ParticleType::Halo as u8,
            id: 1,
            generation: 0,
            timebin: 1,
            grav_cost: 0.0,
            key: 0,
            pi: NO_AUX_INDEX,
            on_another_domain: false,
            will_export: false,
        };
        assert_eq!(p.work(), 0.5);
        p.timebin = 2;
        assert_eq!(p.work(), 0.25);
    }
}
