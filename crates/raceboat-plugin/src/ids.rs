use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit handle minted by the core for every asynchronous request so a
/// later plugin callback can be matched back to the call that caused it.
///
/// `RaceHandle`s are never reused within a process run (§8, invariant 1).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RaceHandle(u64);

/// Sentinel for "no handle" — used by plugin callbacks that are not a reply
/// to any specific outbound call (e.g. an unsolicited link status change).
pub const NULL_RACE_HANDLE: RaceHandle = RaceHandle(0);

impl RaceHandle {
    /// Wrap a raw value. Only the core's handle generator and test code
    /// should call this directly; plugins receive handles, they don't mint
    /// them.
    pub const fn from_raw(value: u64) -> Self {
        RaceHandle(value)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for RaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaceHandle({})", self.0)
    }
}

impl fmt::Display for RaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Monotone generator for [`RaceHandle`]s. Starts at 1 so `0` can remain the
/// null sentinel.
#[derive(Debug, Default)]
pub struct HandleGenerator {
    next: AtomicU64,
}

impl HandleGenerator {
    pub const fn new() -> Self {
        HandleGenerator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> RaceHandle {
        RaceHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

macro_rules! string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(ChannelId, "Name of a transport channel, e.g. `twoSixDirectCpp`.");
string_id!(LinkId, "One link within a channel, issued by the plugin.");
string_id!(ConnectionId, "One open connection on a link, issued by the plugin.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_monotone_and_never_reused() {
        let gen = HandleGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a < b && b < c);
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert!(NULL_RACE_HANDLE.is_null());
    }

    #[test]
    fn channel_id_equality_is_by_value() {
        let a: ChannelId = "twoSixDirectCpp".into();
        let b: ChannelId = "twoSixDirectCpp".into();
        assert_eq!(a, b);
    }
}
