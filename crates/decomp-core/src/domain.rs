//! The periodic simulation box.

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};
use serde::{Deserialize, Serialize};

use crate::peano::PositionType;

/// A periodic box `[origin, origin + diameter)` in each dimension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Domain {
    pub origin: [PositionType; 3],
    pub diameter: [PositionType; 3],
}

impl Default for Domain {
    fn default() -> Self {
        Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [1.0, 1.0, 1.0],
        }
    }
}

impl Domain {
    pub fn cubic(box_size: PositionType) -> Self {
        Domain {
            origin: [0.0, 0.0, 0.0],
            diameter: [box_size; 3],
        }
    }

    /// Wrap a position into the canonical periodic box.
    pub fn wrap(&self, position: [PositionType; 3]) -> [PositionType; 3] {
        let mut out = position;
        for d in 0..3 {
            let mut rel = (out[d] - self.origin[d]) / self.diameter[d];
            rel -= rel.floor();
            out[d] = self.origin[d] + rel * self.diameter[d];
        }
        out
    }
}

unsafe impl Equivalence for Domain {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1],
            &[
                offset_of!(Domain, origin) as Address,
                offset_of!(Domain, diameter) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(3, &PositionType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(3, &PositionType::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_brings_positions_back_into_the_box() {
        let domain = Domain::cubic(1.0);
        assert_eq!(domain.wrap([1.5, -0.5, 0.25]), [0.5, 0.5, 0.25]);
    }
}
