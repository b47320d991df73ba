//! Strongly-typed identifiers for per-query arena slots.
//!
//! Ids are dense `u32` indexes into the owning arena's vectors. Downstream
//! crates should *not* use raw integers for references between plan objects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Anything that can be stored in an [`crate::bitset::IdSet`].
pub trait RawId: Copy {
    fn raw(self) -> u32;
    fn from_raw(v: u32) -> Self;
}

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(v: u32) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u32 {
                self.0
            }
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl crate::id::RawId for $name {
            fn raw(self) -> u32 {
                self.0
            }
            fn from_raw(v: u32) -> Self {
                Self(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(NameId);
new_id!(PathId);
new_id!(ExprId);
new_id!(ColumnId);
new_id!(TableId);
new_id!(RelId);
new_id!(PlanId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_indexes() {
        let id = ExprId::new(7);
        assert_eq!(id.get(), 7);
        assert_eq!(id.index(), 7);
        assert_eq!(format!("{id}"), "ExprId(7)");
    }
}
