//! `respond_to?` predicate sites.
//!
//! A site for `recv.respond_to?(:name)` remembers the last answer together
//! with everything it depends on. The answer is reused only when all of
//! them match:
//!
//! ```text
//!   (queried name, include_all, receiver class, registry version) ──► answer
//! ```
//!
//! Answers are only published while `respond_to?` is the built-in, and a
//! negative answer only while `respond_to_missing?` is too, since a guest
//! `respond_to_missing?` may answer differently on every call.

use super::caching::CachingCallSite;
use super::helper::DispatchHelper;
use super::stats::{SiteClassification, SiteStatsSnapshot};
use crate::config::DispatchConfig;
use arc_swap::ArcSwapOption;
use garnet_runtime::builtins::{self, RESPOND_TO, RESPOND_TO_MISSING};
use garnet_runtime::{ClassId, RuntimeResult, ThreadContext, Value};
use std::sync::Arc;

#[derive(Debug)]
struct Answer {
    name: Arc<str>,
    include_all: bool,
    class: ClassId,
    version: u64,
    answer: bool,
}

/// Call site for `respond_to?` with a constant method name.
#[derive(Debug)]
pub struct RespondToCallSite {
    queried: Arc<str>,
    enabled: bool,
    answer: ArcSwapOption<Answer>,
    generic: CachingCallSite,
}

impl RespondToCallSite {
    pub fn new(queried: Arc<str>, helper: Arc<DispatchHelper>, config: &DispatchConfig) -> Self {
        Self {
            queried,
            enabled: config.cache_respond_to,
            answer: ArcSwapOption::empty(),
            generic: CachingCallSite::new(helper, config),
        }
    }

    #[inline]
    pub fn queried(&self) -> &str {
        &self.queried
    }

    /// Whether `receiver` responds to the queried name.
    pub fn probe(&self, ctx: &mut ThreadContext, receiver: &Value) -> RuntimeResult<bool> {
        self.probe_with(ctx, receiver, false)
    }

    pub fn probe_with(&self, ctx: &mut ThreadContext, receiver: &Value, include_all: bool) -> RuntimeResult<bool> {
        let class = receiver.class_id();
        let stats = self.generic.stats();
        if self.enabled {
            let version = ctx.registry().redefinition_version();
            if let Some(cached) = &*self.answer.load() {
                if cached.class == class
                    && cached.version == version
                    && cached.include_all == include_all
                    && cached.name == self.queried
                {
                    stats.hit();
                    return Ok(cached.answer);
                }
            }
        }

        stats.miss();
        stats.lookup();
        let resolution = ctx.registry().lookup(RESPOND_TO, class);
        let builtin = resolution.found && resolution.target.as_ref().is_some_and(|m| m.is_builtin());
        if !builtin {
            // Guest respond_to?: ask it every time.
            let args = [Value::symbol(&self.queried), Value::Bool(include_all)];
            let args = if include_all { &args[..] } else { &args[..1] };
            return self
                .generic
                .helper()
                .call_resolved(ctx, &resolution, receiver, args, None)
                .map(|v| v.is_truthy());
        }

        let answer = builtins::respond_to(ctx, receiver, &self.queried, include_all)?;
        if self.enabled {
            let missing_builtin = ctx
                .registry()
                .find_method(RESPOND_TO_MISSING, class)
                .map_or(true, |m| m.is_builtin());
            if answer || missing_builtin {
                self.answer.store(Some(Arc::new(Answer {
                    name: self.queried.clone(),
                    include_all,
                    class,
                    version: resolution.version,
                    answer,
                })));
                tracing::trace!(name = %self.queried, ?class, answer, "respond_to? answer cached");
            }
        }
        Ok(answer)
    }

    /// Generic entry. Calls of the expected shape go through [`probe`](Self::probe).
    pub fn invoke(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: Option<&Value>,
    ) -> RuntimeResult<Value> {
        if block.is_none() {
            match args {
                [Value::Symbol(name)] if name.as_str() == &*self.queried => {
                    return self.probe_with(ctx, receiver, false).map(Value::Bool);
                }
                [Value::Symbol(name), flag] if name.as_str() == &*self.queried => {
                    return self.probe_with(ctx, receiver, flag.is_truthy()).map(Value::Bool);
                }
                _ => {}
            }
        }
        self.generic.invoke(ctx, receiver, args, block)
    }

    pub fn classification(&self) -> SiteClassification {
        if self.answer.load().is_some() {
            SiteClassification::Monomorphic
        } else {
            self.generic.classification()
        }
    }

    pub fn stats_snapshot(&self) -> SiteStatsSnapshot {
        self.generic.stats_snapshot()
    }
}
