//! # Ripple
//!
//! Change-event routing for replicated record streams: each insert, modify
//! or remove is dispatched to the handlers that care about it, decided by a
//! type match on the record and by filters over which attributes changed
//! and how.
//!
//! ## Core Concepts
//!
//! - [`Value`] = one decoded snapshot of a record
//! - [`AttributeDiff`] = what changed between two snapshots, path by path
//! - [`FilterSpec`] = which changes a handler wants to see
//! - [`Matcher`] = which records a handler wants to see at all
//!
//! The diff engine ([`diff_attributes`]) and the match predicate
//! ([`has_attribute_change`], [`FilterSpec::matches`]) are pure and total.
//! Everything around them is plumbing.
//!
//! ## Architecture
//!
//! ```text
//! Stream source (batch of records)
//!     │
//!     ▼ process()
//! Middleware chain ─► Next ─► Next ─► dispatch loop
//!                                        │
//!                     for each record:   ▼
//!                          unmarshall images (codec)
//!                                        │
//!            ┌───────────────────────────┼────────────────────────┐
//!            ▼                           ▼                        ▼
//!    Handler A: event kind?      Handler B: ...           Handler C: ...
//!               region?
//!               Matcher.matches(image)?
//!               FilterSpec.matches(diff)?  ◄── diff_attributes(old, new)
//!            │                           │                        │
//!            ▼                           ▼                        ▼
//!        inline call               batch (grouped)          DeferQueue
//!            │                           │                        │
//!            └──────────► ProcessOutcome (batch item failures) ◄──┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Absence is not null** - a missing key and an explicit null are
//!    different states, and only non-null to null is `field_cleared`
//! 2. **Parents catch children** - filtering on `a` sees changes at `a.b`,
//!    never the reverse
//! 3. **Collections are leaves** - lists and sets get one collection-level
//!    change, maps get a parent change plus nested changes
//! 4. **Misconfigured filters never fire** - the predicate returns false
//!    rather than failing; [`RouterBuilder::build`] rejects them up front
//! 5. **No ambient state** - the router threads its config into matching
//!
//! ## Example
//!
//! ```ignore
//! use ripple_core::{
//!     handler_fn, ChangeKind, FilterSpec, HandlerOptions, Matcher, RouterBuilder, RouterConfig,
//! };
//!
//! let router = RouterBuilder::new(RouterConfig::from_env()?)
//!     .on_modify_with(
//!         Matcher::field_equals("type", "user"),
//!         handler_fn(|change| async move {
//!             tracing::info!(seq = change.sequence_number(), "email cleared");
//!             Ok(())
//!         }),
//!         HandlerOptions::new().filter(
//!             FilterSpec::attribute("email").change_kinds(ChangeKind::FieldCleared),
//!         ),
//!     )
//!     .build()?;
//!
//! let outcome = router.process(&event).await?;
//! let response = outcome.batch_item_failures();
//! ```

// Engine
mod diff;
mod filter;
mod filter_macro;
mod number;
mod value;

// Plumbing
mod codec;
mod config;
mod error;
mod handler;
mod matcher;
mod middleware;
mod record;
mod router;

// Deferred execution interfaces
pub mod defer;


// Deferral round-trip tests (test-only)
#[cfg(test)]
mod defer_tests;


// Re-export engine types
pub use crate::diff::{
    collection_change, deep_equal, diff_attributes, get_nested_value, AttributeChange,
    AttributeDiff, ChangeKind, UnknownChangeKind,
};
pub use crate::filter::{has_attribute_change, ChangeKinds, FilterSpec};
pub use crate::number::Number;
pub use crate::value::{canonical_key, Map, Value};

// Re-export codec types
pub use codec::{marshall, marshall_value, unmarshall, unmarshall_value, AttributeMap, AttributeValue};

// Re-export record types
pub use record::{EventName, RecordChange, StreamEvent, StreamPayload, StreamRecord};

// Re-export error types
pub use crate::error::{CodecError, RouterError};

// Re-export config types
pub use config::{FailurePolicy, RouterConfig, DEFAULT_DEFER_QUEUE};

// Re-export matcher and handler types
pub use handler::{
    batch_handler_fn, handler_fn, BatchHandler, FnBatchHandler, FnHandler, HandlerOptions,
    RecordHandler, ANY_EVENT,
};
pub use matcher::Matcher;

// Re-export middleware types
pub use middleware::{Middleware, Next, TracingMiddleware};

// Re-export deferral types
pub use defer::{
    drain, ClaimedInvocation, DeferQueue, DeferSpec, DeferStore, DeferredInvocation, DrainOptions,
    DrainReport, FailureKind,
};

// Re-export router types
pub use router::{
    BatchItemFailure, BatchResponse, ProcessOutcome, RecordFailure, RouterBuilder, StreamRouter,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
