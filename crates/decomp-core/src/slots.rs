//! Auxiliary per-type slot tables (§3 Data Model).
//!
//! Gas and black-hole particles carry extra state that the base
//! [`crate::particle::Particle`] row has no room for. Each lives in its
//! own table, cross-referenced from the particle's `pi` field; keeping
//! them separate means the base table stays a fixed-width, MPI-friendly
//! struct regardless of type mix, mirroring how the teacher crate keeps
//! `Point` free of anything that isn't needed to route a particle.

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};
use serde::{Deserialize, Serialize};

/// Extra hydrodynamic state for a gas particle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GasSlot {
    pub density: f64,
    pub entropy: f64,
    pub smoothing_length: f64,
}

unsafe impl Equivalence for GasSlot {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1],
            &[
                offset_of!(GasSlot, density) as Address,
                offset_of!(GasSlot, entropy) as Address,
                offset_of!(GasSlot, smoothing_length) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(1, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &f64::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

/// Extra state for a black-hole particle.
///
/// `reverse_link` holds the index of the owning base particle and is
/// meaningful only during the garbage collector's compaction pass
/// (§4.7): the collector walks the slot table, follows each
/// `reverse_link` back into the particle table to relocate `pi`, and
/// the field is otherwise stale between decompositions.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlackHoleSlot {
    pub accretion_rate: f64,
    pub mass_absorbed: f64,
    pub reverse_link: i64,
}

unsafe impl Equivalence for BlackHoleSlot {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1],
            &[
                offset_of!(BlackHoleSlot, accretion_rate) as Address,
                offset_of!(BlackHoleSlot, mass_absorbed) as Address,
                offset_of!(BlackHoleSlot, reverse_link) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(1, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &i64::equivalent_datatype()).as_ref(),
            ],
        )
    }
}
