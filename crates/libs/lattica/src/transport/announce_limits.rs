use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::hash::ShortHash;

/// Ingress policy for a single announcing destination: a target interval,
/// a grace budget for bursts, and a penalty once the budget is spent.
pub struct AnnounceRateLimit {
    pub target: Duration,
    pub grace: u32,
    pub penalty: Option<Duration>,
}

impl Default for AnnounceRateLimit {
    fn default() -> Self {
        Self {
            target: Duration::from_secs(3600),
            grace: 10,
            penalty: Some(Duration::from_secs(7200)),
        }
    }
}

struct LimitEntry {
    rate_limit: Option<AnnounceRateLimit>,
    violations: u32,
    last_announce: Instant,
    blocked_until: Instant,
}

impl LimitEntry {
    fn new(rate_limit: Option<AnnounceRateLimit>) -> Self {
        let now = Instant::now();
        Self { rate_limit, violations: 0, last_announce: now, blocked_until: now }
    }

    /// Returns how long the destination stays blocked, or None when the
    /// announce is admitted.
    fn admit(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let mut blocked = false;

        if let Some(ref rate_limit) = self.rate_limit {
            if now < self.blocked_until {
                // Announcing while blocked restarts the penalty clock.
                self.blocked_until = now + rate_limit.target;
                if let Some(penalty) = rate_limit.penalty {
                    self.blocked_until += penalty;
                }
                blocked = true;
            } else {
                let next_allowed = self.last_announce + rate_limit.target;
                if now < next_allowed {
                    self.violations += 1;
                    if self.violations >= rate_limit.grace {
                        self.violations = 0;
                        self.blocked_until = now + rate_limit.target;
                        blocked = true;
                    }
                }
            }
        }

        self.last_announce = now;

        blocked.then(|| self.blocked_until - now)
    }
}

/// Per-destination announce admission. Destinations not seen before get the
/// default policy, which throttles new sources that flood.
pub struct AnnounceLimits {
    limits: BTreeMap<ShortHash, LimitEntry>,
}

impl AnnounceLimits {
    pub fn new() -> Self {
        Self { limits: BTreeMap::new() }
    }

    pub fn check(&mut self, destination: &ShortHash) -> Option<Duration> {
        if let Some(entry) = self.limits.get_mut(destination) {
            return entry.admit();
        }

        self.limits.insert(*destination, LimitEntry::new(Some(AnnounceRateLimit::default())));
        None
    }
}

impl Default for AnnounceLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AnnounceLimits, AnnounceRateLimit, LimitEntry};
    use crate::hash::ShortHash;

    #[test]
    fn first_announce_is_admitted() {
        let mut limits = AnnounceLimits::new();
        assert!(limits.check(&ShortHash::of(b"dest")).is_none());
    }

    #[test]
    fn burst_beyond_grace_is_blocked() {
        let mut entry = LimitEntry::new(Some(AnnounceRateLimit {
            target: Duration::from_secs(3600),
            grace: 3,
            penalty: None,
        }));

        assert!(entry.admit().is_none());
        assert!(entry.admit().is_none());
        assert!(entry.admit().is_some(), "third violation exhausts the grace budget");
    }
}
