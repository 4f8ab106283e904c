//! Call-site statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache state of a site, as reported in statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteClassification {
    Empty,
    Monomorphic,
    Megamorphic,
}

/// Per-site counters. Relaxed atomics; exact only once threads quiesce.
#[derive(Debug, Default)]
pub struct SiteStats {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    lookups: AtomicU64,
    fast_path_hits: AtomicU64,
}

impl SiteStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    #[inline(always)]
    fn bump(&self, counter: &AtomicU64) {
        if self.enabled {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn hit(&self) {
        self.bump(&self.hits);
    }

    #[inline(always)]
    pub fn miss(&self) {
        self.bump(&self.misses);
    }

    #[inline(always)]
    pub fn lookup(&self) {
        self.bump(&self.lookups);
    }

    #[inline(always)]
    pub fn fast_path(&self) {
        self.bump(&self.fast_path_hits);
    }

    pub fn snapshot(&self) -> SiteStatsSnapshot {
        SiteStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            fast_path_hits: self.fast_path_hits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SiteStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub lookups: u64,
    pub fast_path_hits: u64,
}

impl SiteStatsSnapshot {
    /// Cache hit rate as a percentage (0.0-100.0).
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f32 / total as f32) * 100.0
        }
    }
}

/// Aggregate over every site of a loaded unit.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitStats {
    /// Sites never executed, so never materialized.
    pub unmaterialized: usize,
    pub empty: usize,
    pub monomorphic: usize,
    pub megamorphic: usize,
    pub hits: u64,
    pub misses: u64,
    pub lookups: u64,
    pub fast_path_hits: u64,
}

impl UnitStats {
    pub(crate) fn record(&mut self, classification: SiteClassification, counters: SiteStatsSnapshot) {
        match classification {
            SiteClassification::Empty => self.empty += 1,
            SiteClassification::Monomorphic => self.monomorphic += 1,
            SiteClassification::Megamorphic => self.megamorphic += 1,
        }
        self.hits += counters.hits;
        self.misses += counters.misses;
        self.lookups += counters.lookups;
        self.fast_path_hits += counters.fast_path_hits;
    }

    /// Total sites.
    pub fn total(&self) -> usize {
        self.unmaterialized + self.empty + self.monomorphic + self.megamorphic
    }

    /// Percentage of sites that are monomorphic.
    pub fn monomorphic_percentage(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.monomorphic as f32 / total as f32) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stats_stay_zero() {
        let stats = SiteStats::new(false);
        stats.hit();
        stats.lookup();
        assert_eq!(stats.snapshot(), SiteStatsSnapshot::default());
    }

    #[test]
    fn test_unit_stats_aggregate() {
        let mut unit = UnitStats::default();
        let counters = SiteStatsSnapshot {
            hits: 9,
            misses: 1,
            lookups: 1,
            fast_path_hits: 0,
        };
        unit.record(SiteClassification::Monomorphic, counters);
        unit.record(SiteClassification::Megamorphic, counters);
        unit.unmaterialized = 2;
        assert_eq!(unit.total(), 4);
        assert_eq!(unit.hits, 18);
        assert!((unit.monomorphic_percentage() - 25.0).abs() < f32::EPSILON);
        assert!((counters.hit_rate() - 90.0).abs() < 0.001);
    }
}
