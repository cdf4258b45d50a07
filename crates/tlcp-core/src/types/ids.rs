use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Macro to define a newtype numeric identifier.
///
/// TLCP identifiers travel on the wire as decimal integers (`LS_reqId`,
/// `LS_subId`, the subscription id field of `U`/`SUBOK` lines...). The
/// newtypes keep request ids, subscription ids and local handles from being
/// mixed up while still printing and parsing as plain numbers.
macro_rules! define_id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw numeric value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw numeric value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id_type!(
    /// Request correlation id (`LS_reqId`).
    ///
    /// Every outgoing request gets a fresh one; `REQOK`/`REQERR` echo it back.
    RequestId
);

define_id_type!(
    /// Subscription id (`LS_subId`).
    ///
    /// Assigned once per subscription manager and never reused by the same
    /// engine, so late events for a discarded manager can be recognised.
    SubscriptionId
);

define_id_type!(
    /// Local handle for a user subscription.
    ///
    /// Stays the same across re-activations, while the [`SubscriptionId`]
    /// changes every time a new manager is created for it.
    SubscriptionHandle
);

define_id_type!(
    /// Local handle for a client message.
    MessageHandle
);

define_id_type!(
    /// Local handle for an MPN subscription.
    MpnHandle
);

/// Monotonic id generator, starting at 1.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    /// Creates a generator whose first id is 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id, never repeating a value.
    pub fn next<T: From<u64>>(&self) -> T {
        T::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_monotonic() {
        let ids = IdGenerator::new();
        let a: RequestId = ids.next();
        let b: RequestId = ids.next();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
    }

    #[test]
    fn ids_print_and_parse_as_numbers() {
        let id = SubscriptionId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<SubscriptionId>().unwrap(), id);
        assert!("x".parse::<SubscriptionId>().is_err());
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&RequestId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
