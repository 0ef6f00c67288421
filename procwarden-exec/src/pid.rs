use std::fmt;

/// Identifier of an OS process.
///
/// Only positive values name real processes. [`Pid::NOT_FOUND`] (any negative
/// value, really) means "not found / not running" and is never signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(i32);

impl Pid {
    pub const NOT_FOUND: Pid = Pid(-1);

    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// True for values that can name a real process.
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl Default for Pid {
    fn default() -> Self {
        Self::NOT_FOUND
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl From<u32> for Pid {
    fn from(raw: u32) -> Self {
        i32::try_from(raw).map_or(Self::NOT_FOUND, Self)
    }
}

impl From<Pid> for nix::unistd::Pid {
    fn from(pid: Pid) -> Self {
        nix::unistd::Pid::from_raw(pid.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_and_zero_are_not_processes() {
        assert!(!Pid::NOT_FOUND.is_valid());
        assert!(!Pid::new(0).is_valid());
        assert!(Pid::new(1).is_valid());
    }

    #[test]
    fn oversized_child_ids_map_to_not_found() {
        assert_eq!(Pid::from(u32::MAX), Pid::NOT_FOUND);
        assert_eq!(Pid::from(4242_u32), Pid::new(4242));
    }

    #[test]
    fn equality_is_numeric() {
        assert_eq!(Pid::new(17), Pid::from(17));
        assert_eq!(Pid::new(17).to_string(), "17");
    }
}
