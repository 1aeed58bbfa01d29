// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ordered filter pipeline.
//!
//! Filters are kept sorted by `(phase, priority)`.  A filter whose key equals
//! an existing one is inserted after it, so registration order breaks ties
//! and every run of a phase sees the same sequence.

use std::sync::Arc;

use super::predicates::Predicate;
use crate::core::{Filter, FilterPhase, GatewayError, RequestContext};
use crate::{debug_fmt, error_fmt, trace_fmt, warn_fmt};

/// Where and when a filter runs. `None` fields fall back to the filter's
/// own [`Filter::phase`] / [`Filter::priority`].
#[derive(Debug, Clone, Default)]
pub struct FilterDescriptor {
    pub phase: Option<FilterPhase>,
    pub priority: Option<i32>,
    /// All must match, in addition to [`Filter::should_filter`].
    pub when: Vec<Arc<dyn Predicate>>,
}

#[derive(Debug, Clone)]
struct RegisteredFilter {
    filter: Arc<dyn Filter>,
    phase: FilterPhase,
    priority: i32,
    when: Vec<Arc<dyn Predicate>>,
}

impl RegisteredFilter {
    fn applies(&self, ctx: &RequestContext) -> bool {
        self.when.iter().all(|p| p.matches(ctx)) && self.filter.should_filter(ctx)
    }
}

/// Result of running one phase.
#[derive(Debug)]
pub enum PhaseOutcome {
    /// Every applicable filter ran.
    Completed,
    /// A pre/route filter cleared `should_forward`.
    ShortCircuited,
    /// A filter raised; the rest of the phase was skipped.
    Failed { filter: String, error: GatewayError },
}

/// Registered filters, immutable once the gateway is built.
#[derive(Debug, Default)]
pub struct FilterPipeline {
    filters: Vec<RegisteredFilter>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter at its own phase and priority.
    pub fn register(&mut self, filter: Arc<dyn Filter>) {
        self.register_with(filter, FilterDescriptor::default());
    }

    /// Register a filter with an explicit placement.
    pub fn register_with(&mut self, filter: Arc<dyn Filter>, descriptor: FilterDescriptor) {
        let phase = descriptor.phase.unwrap_or_else(|| filter.phase());
        let priority = descriptor.priority.unwrap_or_else(|| filter.priority());
        let index = self
            .filters
            .partition_point(|f| (f.phase, f.priority) <= (phase, priority));

        debug_fmt!(
            "Pipeline",
            "Registered filter '{}' (phase={}, priority={}, predicates={})",
            filter.name(),
            phase,
            priority,
            descriptor.when.len()
        );

        self.filters.insert(
            index,
            RegisteredFilter {
                filter,
                phase,
                priority,
                when: descriptor.when,
            },
        );
    }

    /// Total number of registered filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Names of the filters of `phase`, in execution order.
    pub fn names(&self, phase: FilterPhase) -> Vec<&str> {
        self.phase_slice(phase)
            .iter()
            .map(|f| f.filter.name())
            .collect()
    }

    fn phase_slice(&self, phase: FilterPhase) -> &[RegisteredFilter] {
        let start = self.filters.partition_point(|f| f.phase < phase);
        let end = self.filters.partition_point(|f| f.phase <= phase);
        &self.filters[start..end]
    }

    /// Run every applicable filter of `phase` against `ctx`, in order.
    pub async fn run(&self, phase: FilterPhase, ctx: &mut RequestContext) -> PhaseOutcome {
        ctx.phase = phase;

        if phase.can_short_circuit() && !ctx.should_forward {
            return PhaseOutcome::ShortCircuited;
        }

        for entry in self.phase_slice(phase) {
            let name = entry.filter.name();

            if !entry.applies(ctx) {
                trace_fmt!("Pipeline", "[{}] skipping {} filter '{}'", ctx.trace_id, phase, name);
                continue;
            }

            trace_fmt!("Pipeline", "[{}] running {} filter '{}'", ctx.trace_id, phase, name);

            if let Err(error) = entry.filter.run(ctx).await {
                if phase == FilterPhase::Error {
                    warn_fmt!("Pipeline", "[{}] error filter '{}' failed: {}", ctx.trace_id, name, error);
                    continue;
                }
                error_fmt!("Pipeline", "[{}] {} filter '{}' failed: {}", ctx.trace_id, phase, name, error);
                return PhaseOutcome::Failed {
                    filter: name.to_string(),
                    error,
                };
            }

            if phase.can_short_circuit() && !ctx.should_forward {
                debug_fmt!(
                    "Pipeline",
                    "[{}] {} filter '{}' stopped forwarding",
                    ctx.trace_id,
                    phase,
                    name
                );
                return PhaseOutcome::ShortCircuited;
            }
        }

        PhaseOutcome::Completed
    }
}
