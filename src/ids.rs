use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source of fresh identities. Callers pass one in so that transitions stay
/// deterministic under test.
pub trait IdGenerator: Send {
    fn next_uuid(&mut self) -> Uuid;
}

/// Random v4 identities.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn next_uuid(&mut self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Counts upwards from a starting value. Each test run owns its own instance.
#[derive(Debug, Clone)]
pub struct SequentialIds {
    next: u128,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(start: u128) -> Self {
        Self { next: start }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_uuid(&mut self) -> Uuid {
        let id = Uuid::from_u128(self.next);
        self.next += 1;
        id
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate(ids: &mut dyn IdGenerator) -> Self {
                Self(ids.next_uuid())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Globally unique identity of a feature flag.
    FlagId
);
id_type!(RevisionId);
id_type!(RuleId);
id_type!(UserId);
id_type!(OrganizationId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_distinct_and_ordered() {
        let mut ids = SequentialIds::new();
        let a = RevisionId::generate(&mut ids);
        let b = RevisionId::generate(&mut ids);
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.as_uuid(), Uuid::from_u128(1));
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let mut ids = RandomIds;
        let id = FlagId::generate(&mut ids);
        let parsed: FlagId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<FlagId>().is_err());
    }
}
