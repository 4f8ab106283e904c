//! Generic caching call site.

use super::cache::{CacheLookup, InlineCache};
use super::helper::DispatchHelper;
use super::stats::{SiteClassification, SiteStats, SiteStatsSnapshot};
use crate::config::DispatchConfig;
use garnet_runtime::{RuntimeResult, ThreadContext, Value};
use std::sync::Arc;

/// A call site backed by a monomorphic inline cache.
///
/// `super` sites resolve relative to the running method's owner, which the
/// cache key does not capture, so they always take the full lookup.
#[derive(Debug)]
pub struct CachingCallSite {
    helper: Arc<DispatchHelper>,
    cache: InlineCache,
    cacheable: bool,
    stats: SiteStats,
}

impl CachingCallSite {
    pub fn new(helper: Arc<DispatchHelper>, config: &DispatchConfig) -> Self {
        let cacheable = helper.call_type() != garnet_ir::CallType::Super;
        Self {
            helper,
            cache: InlineCache::new(config.miss_tolerance),
            cacheable,
            stats: SiteStats::new(config.collect_stats),
        }
    }

    #[inline]
    pub fn helper(&self) -> &Arc<DispatchHelper> {
        &self.helper
    }

    #[inline]
    pub fn cache(&self) -> &InlineCache {
        &self.cache
    }

    #[inline]
    pub(crate) fn stats(&self) -> &SiteStats {
        &self.stats
    }

    pub fn invoke(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if !self.cacheable {
            self.stats.lookup();
            return self.helper.dispatch(ctx, receiver, args, block);
        }

        let class = receiver.class_id();
        let version = ctx.registry().redefinition_version();
        match self.cache.get(class, version) {
            CacheLookup::Hit(method) => {
                self.stats.hit();
                self.helper.call_method(ctx, &method, receiver, args, block)
            }
            CacheLookup::Megamorphic => {
                self.stats.lookup();
                self.helper.dispatch(ctx, receiver, args, block)
            }
            CacheLookup::Miss(kind) => {
                self.stats.miss();
                self.stats.lookup();
                let resolution = self.helper.resolve(ctx, class);
                self.cache.publish(class, &resolution, kind);
                self.helper.call_resolved(ctx, &resolution, receiver, args, block)
            }
        }
    }

    pub fn classification(&self) -> SiteClassification {
        self.cache.classification()
    }

    pub fn stats_snapshot(&self) -> SiteStatsSnapshot {
        self.stats.snapshot()
    }
}
