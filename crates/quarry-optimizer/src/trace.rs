//! Memo trace events.
//!
//! When a trace flag is set, every memo event (candidate retained,
//! discarded over the cutoff, sampled) is reported to the sink. The default
//! sink logs through `tracing`; tests install a collecting sink.

use quarry_core::config::{TRACE_EXCEEDED_BEST, TRACE_RETAINED, TRACE_SAMPLE};

use crate::relation::PlanCost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    Retained,
    ExceededBest,
    Sampled,
}

impl TraceEventKind {
    pub fn flag(self) -> u32 {
        match self {
            TraceEventKind::Retained => TRACE_RETAINED,
            TraceEventKind::ExceededBest => TRACE_EXCEEDED_BEST,
            TraceEventKind::Sampled => TRACE_SAMPLE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TraceEventKind::Retained => "retained",
            TraceEventKind::ExceededBest => "exceeded_best",
            TraceEventKind::Sampled => "sampled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub plan_id: u32,
    pub cost: PlanCost,
    /// Short operator-shape description, e.g. `scan(nation) join(region)`.
    pub op_shape: String,
}

pub trait TraceSink: Send {
    fn event(&self, event: TraceEvent);
}

/// Default sink: structured log lines.
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn event(&self, event: TraceEvent) {
        tracing::debug!(
            event = event.kind.name(),
            plan_id = event.plan_id,
            cost = event.cost.total(),
            shape = %event.op_shape,
            "memo event"
        );
    }
}

/// Collects events for inspection; used by tests.
#[derive(Default)]
pub struct CollectingSink {
    pub events: parking_lot::Mutex<Vec<TraceEvent>>,
}

impl TraceSink for std::sync::Arc<CollectingSink> {
    fn event(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}
