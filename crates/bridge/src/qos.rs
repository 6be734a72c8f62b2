use crate::BridgeError;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    BestEffort,
}

impl Reliability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reliability::Reliable => "reliable",
            Reliability::BestEffort => "best_effort",
        }
    }
}

/// Accepts names as well as the numeric policy values used by DDS tooling
/// (`0` system default, `1` reliable, `2` best effort).
impl FromStr for Reliability {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reliable" | "system_default" | "0" | "1" => Ok(Reliability::Reliable),
            "best_effort" | "besteffort" | "2" => Ok(Reliability::BestEffort),
            other => Err(BridgeError::UnknownReliability(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// Bounded queue; the oldest message is dropped when full.
    KeepLast(usize),
    KeepAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Volatile,
    /// The last published message is replayed to late subscribers.
    TransientLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub history: History,
    pub durability: Durability,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self::keep_last(10)
    }
}

impl QosProfile {
    pub fn keep_last(depth: usize) -> Self {
        Self {
            reliability: Reliability::Reliable,
            history: History::KeepLast(depth),
            durability: Durability::Volatile,
        }
    }

    /// Camera stream profile: only the newest frame matters.
    pub fn sensor_data(reliability: Reliability) -> Self {
        Self {
            reliability,
            history: History::KeepLast(1),
            durability: Durability::Volatile,
        }
    }

    pub fn with_reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn depth(&self) -> Option<usize> {
        match self.history {
            History::KeepLast(depth) => Some(depth.max(1)),
            History::KeepAll => None,
        }
    }

    /// Whether a publisher offering `self` can serve a subscriber requesting
    /// `requested`. Offers must be at least as strong as requests.
    pub fn is_compatible_with(&self, requested: &QosProfile) -> bool {
        let reliability_ok = !(self.reliability == Reliability::BestEffort
            && requested.reliability == Reliability::Reliable);
        let durability_ok = !(self.durability == Durability::Volatile
            && requested.durability == Durability::TransientLocal);
        reliability_ok && durability_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability_parses_names_and_numbers() {
        assert_eq!("reliable".parse::<Reliability>().unwrap(), Reliability::Reliable);
        assert_eq!("RELIABLE".parse::<Reliability>().unwrap(), Reliability::Reliable);
        assert_eq!("1".parse::<Reliability>().unwrap(), Reliability::Reliable);
        assert_eq!("0".parse::<Reliability>().unwrap(), Reliability::Reliable);
        assert_eq!(
            "best_effort".parse::<Reliability>().unwrap(),
            Reliability::BestEffort
        );
        assert_eq!("2".parse::<Reliability>().unwrap(), Reliability::BestEffort);
        assert!("sometimes".parse::<Reliability>().is_err());
    }

    #[test]
    fn test_default_profile_is_reliable_keep_last_ten() {
        let qos = QosProfile::default();
        assert_eq!(qos.reliability, Reliability::Reliable);
        assert_eq!(qos.depth(), Some(10));
        assert_eq!(qos.durability, Durability::Volatile);
    }

    #[test]
    fn test_sensor_profile_keeps_single_frame() {
        let qos = QosProfile::sensor_data(Reliability::BestEffort);
        assert_eq!(qos.depth(), Some(1));
        assert_eq!(qos.reliability, Reliability::BestEffort);
    }

    #[test]
    fn test_zero_depth_is_clamped() {
        assert_eq!(QosProfile::keep_last(0).depth(), Some(1));
        let all = QosProfile {
            history: History::KeepAll,
            ..QosProfile::default()
        };
        assert_eq!(all.depth(), None);
    }

    #[test]
    fn test_reliability_compatibility() {
        let reliable = QosProfile::default();
        let best_effort = QosProfile::default().with_reliability(Reliability::BestEffort);

        assert!(reliable.is_compatible_with(&reliable));
        assert!(reliable.is_compatible_with(&best_effort));
        assert!(best_effort.is_compatible_with(&best_effort));
        assert!(
            !best_effort.is_compatible_with(&reliable),
            "best-effort offer cannot satisfy a reliable request"
        );
    }

    #[test]
    fn test_durability_compatibility() {
        let volatile = QosProfile::default();
        let latched = QosProfile::default().with_durability(Durability::TransientLocal);

        assert!(latched.is_compatible_with(&volatile));
        assert!(latched.is_compatible_with(&latched));
        assert!(!volatile.is_compatible_with(&latched));
    }
}
