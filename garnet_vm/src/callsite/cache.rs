//! Inline cache state machine.
//!
//! ```text
//!                ┌─────────┐
//!        ┌──────►│  Empty  │◄──────────── version moved (no miss counted)
//!        │       └────┬────┘
//!        │            │ cacheable resolution
//!        │     ╔══════▼══════╗
//!        └─────║ Monomorphic ║◄─┐ class miss: re-resolve, republish
//!              ╚══════╤══════╝──┘
//!                     │ miss_tolerance class misses
//!              ┌──────▼──────┐
//!              │ Megamorphic │   sticky, full lookup every call
//!              └─────────────┘
//! ```
//!
//! The state is one immutable snapshot behind an [`ArcSwap`]. Readers load
//! it without locking; writers publish a complete replacement, so a reader
//! never observes a half-written entry.

use super::stats::SiteClassification;
use arc_swap::ArcSwap;
use garnet_runtime::{ClassId, MethodEntry, Resolution};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A resolved method remembered for one receiver class.
#[derive(Debug)]
pub struct CacheEntry {
    class: ClassId,
    /// Registry version read before the lookup that produced `method`.
    version: u64,
    method: Arc<MethodEntry>,
}

impl CacheEntry {
    #[inline]
    pub fn class(&self) -> ClassId {
        self.class
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn method(&self) -> &Arc<MethodEntry> {
        &self.method
    }
}

/// Published state of a site.
#[derive(Debug)]
pub enum SiteState {
    Empty,
    Monomorphic(CacheEntry),
    Megamorphic,
}

/// Why the cache could not answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissKind {
    /// Nothing cached yet.
    Empty,
    /// The cached entry predates a redefinition.
    Stale,
    /// A different receiver class.
    Class,
}

/// Result of consulting the cache.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(Arc<MethodEntry>),
    Miss(MissKind),
    Megamorphic,
}

/// One site's inline cache.
#[derive(Debug)]
pub struct InlineCache {
    state: ArcSwap<SiteState>,
    misses: AtomicU32,
    tolerance: u32,
}

impl InlineCache {
    pub fn new(tolerance: u32) -> Self {
        Self {
            state: ArcSwap::from_pointee(SiteState::Empty),
            misses: AtomicU32::new(0),
            tolerance,
        }
    }

    /// Consult the cache for a receiver of `class` at registry `version`.
    #[inline(always)]
    pub fn get(&self, class: ClassId, version: u64) -> CacheLookup {
        let state = self.state.load();
        match &**state {
            SiteState::Monomorphic(entry) if entry.class == class && entry.version == version => {
                CacheLookup::Hit(entry.method.clone())
            }
            SiteState::Monomorphic(entry) if entry.version != version => CacheLookup::Miss(MissKind::Stale),
            SiteState::Monomorphic(_) => CacheLookup::Miss(MissKind::Class),
            SiteState::Empty => CacheLookup::Miss(MissKind::Empty),
            SiteState::Megamorphic => CacheLookup::Megamorphic,
        }
    }

    /// Record the resolution performed after a miss of `kind`.
    #[cold]
    pub fn publish(&self, class: ClassId, resolution: &Resolution, kind: MissKind) {
        if kind == MissKind::Class {
            let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
            if misses >= self.tolerance {
                self.state.store(Arc::new(SiteState::Megamorphic));
                tracing::debug!(?class, misses, "call site went megamorphic");
                return;
            }
        }

        let next = match &resolution.target {
            Some(method) if resolution.is_cacheable() => SiteState::Monomorphic(CacheEntry {
                class,
                version: resolution.version,
                method: method.clone(),
            }),
            // Hooks are never cached; an outdated entry is dropped.
            _ if kind == MissKind::Stale => SiteState::Empty,
            _ => return,
        };
        if matches!(next, SiteState::Empty) {
            tracing::trace!(?class, "stale cache entry invalidated");
        } else {
            tracing::trace!(?class, version = resolution.version, ?kind, "monomorphic entry captured");
        }

        let next = Arc::new(next);
        // Never replace Megamorphic; another thread may have just published it.
        self.state.rcu(|current| {
            if matches!(**current, SiteState::Megamorphic) {
                Arc::clone(current)
            } else {
                Arc::clone(&next)
            }
        });
    }

    #[inline]
    pub fn is_megamorphic(&self) -> bool {
        matches!(**self.state.load(), SiteState::Megamorphic)
    }

    /// Class misses counted so far.
    #[inline]
    pub fn miss_count(&self) -> u32 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn classification(&self) -> SiteClassification {
        match **self.state.load() {
            SiteState::Empty => SiteClassification::Empty,
            SiteState::Monomorphic(_) => SiteClassification::Monomorphic,
            SiteState::Megamorphic => SiteClassification::Megamorphic,
        }
    }

    /// The current snapshot.
    pub fn state(&self) -> Arc<SiteState> {
        self.state.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_runtime::{native, MethodRegistry, Value};

    fn registry_with_foo() -> (MethodRegistry, ClassId, ClassId) {
        let registry = MethodRegistry::new();
        let a = registry.define_class("A", ClassId::OBJECT).unwrap();
        let b = registry.define_class("B", ClassId::OBJECT).unwrap();
        for class in [a, b] {
            registry
                .define_native(class, "foo", Some(0), native(|_, _, _, _| Ok(Value::Nil)))
                .unwrap();
        }
        (registry, a, b)
    }

    #[test]
    fn test_empty_then_monomorphic_hit() {
        let (registry, a, _) = registry_with_foo();
        let cache = InlineCache::new(8);
        let version = registry.redefinition_version();

        assert!(matches!(cache.get(a, version), CacheLookup::Miss(MissKind::Empty)));
        cache.publish(a, &registry.lookup("foo", a), MissKind::Empty);
        assert!(matches!(cache.get(a, version), CacheLookup::Hit(_)));
        assert_eq!(cache.classification(), SiteClassification::Monomorphic);
        assert_eq!(cache.miss_count(), 0);
    }

    #[test]
    fn test_version_change_is_stale_not_a_miss() {
        let (registry, a, _) = registry_with_foo();
        let cache = InlineCache::new(1);
        cache.publish(a, &registry.lookup("foo", a), MissKind::Empty);

        registry
            .define_native(a, "bar", Some(0), native(|_, _, _, _| Ok(Value::Nil)))
            .unwrap();
        let version = registry.redefinition_version();
        assert!(matches!(cache.get(a, version), CacheLookup::Miss(MissKind::Stale)));
        cache.publish(a, &registry.lookup("foo", a), MissKind::Stale);
        assert!(matches!(cache.get(a, version), CacheLookup::Hit(_)));
        assert_eq!(cache.miss_count(), 0);
    }

    #[test]
    fn test_megamorphic_after_tolerance_and_sticky() {
        let (registry, a, b) = registry_with_foo();
        let cache = InlineCache::new(2);
        let version = registry.redefinition_version();
        cache.publish(a, &registry.lookup("foo", a), MissKind::Empty);

        cache.publish(b, &registry.lookup("foo", b), MissKind::Class);
        assert_eq!(cache.classification(), SiteClassification::Monomorphic);
        cache.publish(a, &registry.lookup("foo", a), MissKind::Class);
        assert!(cache.is_megamorphic());

        // A late publish from a racing thread does not revive the entry.
        cache.publish(a, &registry.lookup("foo", a), MissKind::Empty);
        assert!(matches!(cache.get(a, version), CacheLookup::Megamorphic));
    }

    #[test]
    fn test_hook_resolutions_are_not_cached() {
        let registry = MethodRegistry::new();
        let a = registry.define_class("A", ClassId::OBJECT).unwrap();
        registry
            .define_native(a, garnet_runtime::METHOD_MISSING, None, native(|_, _, _, _| Ok(Value::Nil)))
            .unwrap();
        let cache = InlineCache::new(8);
        cache.publish(a, &registry.lookup("ghost", a), MissKind::Empty);
        assert_eq!(cache.classification(), SiteClassification::Empty);
    }
}
