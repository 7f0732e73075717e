//! Action-verb resolution, plan caching and unknown-verb escalation.

pub mod escalation;
pub mod plan_cache;
pub mod resolver;

pub use escalation::{
    build_goal, CapabilityGenerator, DisabledGenerator, EscalationOutcome, GenerationError,
    HttpGenerator, UnknownVerbHandler,
};
pub use plan_cache::{CachedPlan, FilePlanCache, InMemoryPlanCache, PlanCache, PlanCacheError};
pub use resolver::{InvocationRequest, VerbResolver};
