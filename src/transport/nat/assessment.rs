//! NAT behaviour classification.
//!
//! The mediator reports the public endpoint it observed for each probe sent
//! from the engine's socket. Comparing those observations with each other
//! and with the local port tells how predictable our mapping is.

use std::net::SocketAddrV4;
use std::sync::RwLock;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatLevel {
    /// Public port equals the local port on every probe
    ConsistentPortForwarded,
    /// Same public endpoint on every probe
    ConsistentTranslation,
    /// Ports move by a steady small delta; prediction may work
    PossiblyWorkable,
    Unworkable,
}

impl NatLevel {
    /// Whether the peer can punch straight at our reported public endpoint.
    pub fn allows_direct_punch(self) -> bool {
        matches!(
            self,
            NatLevel::ConsistentPortForwarded | NatLevel::ConsistentTranslation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatAssessment {
    pub level: NatLevel,
    /// False only when a reply from the mediator's alternate address got in
    pub inbound_filtered: bool,
    /// Public endpoint from the first observation
    pub public: Option<SocketAddrV4>,
    /// Port step between consecutive mappings when it was steady
    pub port_delta: Option<i32>,
}

impl NatAssessment {
    pub fn unworkable() -> Self {
        Self {
            level: NatLevel::Unworkable,
            inbound_filtered: true,
            public: None,
            port_delta: None,
        }
    }
}

/// Classify a set of mediator observations, in probe order.
pub fn classify(local_port: u16, observed: &[SocketAddrV4], max_port_delta: u16) -> NatAssessment {
    let Some(first) = observed.first().copied() else {
        return NatAssessment::unworkable();
    };

    let mut assessment = NatAssessment {
        level: NatLevel::Unworkable,
        inbound_filtered: true,
        public: Some(first),
        port_delta: None,
    };

    if observed.iter().any(|addr| addr.ip() != first.ip()) {
        debug!(public = %first, "mediator saw different public addresses");
        return assessment;
    }

    if observed.iter().all(|addr| addr.port() == local_port) {
        assessment.level = NatLevel::ConsistentPortForwarded;
        assessment.port_delta = Some(0);
        return assessment;
    }

    if observed.iter().all(|addr| *addr == first) {
        assessment.level = NatLevel::ConsistentTranslation;
        assessment.port_delta = Some(0);
        return assessment;
    }

    let deltas: Vec<i32> = observed
        .windows(2)
        .map(|pair| i32::from(pair[1].port()) - i32::from(pair[0].port()))
        .collect();
    if let Some(&delta) = deltas.first() {
        let steady = deltas.iter().all(|d| *d == delta);
        if steady && delta != 0 && delta.unsigned_abs() <= u32::from(max_port_delta) {
            assessment.level = NatLevel::PossiblyWorkable;
            assessment.port_delta = Some(delta);
        }
    }
    assessment
}

/// Read-mostly holder for the current assessment.
#[derive(Debug, Default)]
pub struct AssessmentCache {
    current: RwLock<Option<NatAssessment>>,
}

impl AssessmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<NatAssessment> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    pub fn set(&self, assessment: NatAssessment) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Some(assessment);
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.current.write() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), port)
    }

    #[test]
    fn test_no_observation_is_unworkable() {
        let assessment = classify(5000, &[], 8);
        assert_eq!(assessment.level, NatLevel::Unworkable);
        assert_eq!(assessment.public, None);
    }

    #[test]
    fn test_port_forwarded() {
        let assessment = classify(5000, &[addr(5000), addr(5000)], 8);
        assert_eq!(assessment.level, NatLevel::ConsistentPortForwarded);
        assert!(assessment.level.allows_direct_punch());
    }

    #[test]
    fn test_consistent_translation() {
        let assessment = classify(5000, &[addr(41000), addr(41000)], 8);
        assert_eq!(assessment.level, NatLevel::ConsistentTranslation);
        assert_eq!(assessment.public, Some(addr(41000)));
    }

    #[test]
    fn test_sequential_allocation() {
        let assessment = classify(5000, &[addr(41000), addr(41002), addr(41004)], 8);
        assert_eq!(assessment.level, NatLevel::PossiblyWorkable);
        assert_eq!(assessment.port_delta, Some(2));
        assert!(!assessment.level.allows_direct_punch());
    }

    #[test]
    fn test_erratic_or_wide_allocation() {
        assert_eq!(
            classify(5000, &[addr(41000), addr(41002), addr(41009)], 8).level,
            NatLevel::Unworkable
        );
        assert_eq!(
            classify(5000, &[addr(41000), addr(42000)], 8).level,
            NatLevel::Unworkable
        );

        let other_ip = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 1), 41000);
        assert_eq!(
            classify(5000, &[addr(41000), other_ip], 8).level,
            NatLevel::Unworkable
        );
    }

    #[test]
    fn test_cache_prime_and_invalidate() {
        let cache = AssessmentCache::new();
        assert!(cache.get().is_none());

        cache.set(classify(5000, &[addr(5000)], 8));
        assert_eq!(
            cache.get().map(|a| a.level),
            Some(NatLevel::ConsistentPortForwarded)
        );

        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
