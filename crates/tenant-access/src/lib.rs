//! Tenant authentication and upstream credential management
//!
//! Everything between an inbound API key and a live upstream credential:
//! fixed-window rate limiting, OAuth token lifecycle with single-flight
//! refresh, the OAuth install flow, tenant registration, and the resolver
//! that ties them together into a `TenantContext`.
//!
//! Components are plain structs built once at startup and shared via `Arc`.

pub mod error;
pub mod install;
pub mod lifecycle;
pub mod limiter;
pub mod refresh;
pub mod registration;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use install::{AuthorizationRedirect, CompletedInstall, InstallFlow, PendingInstall};
pub use lifecycle::TokenLifecycleManager;
pub use limiter::{FixedWindowLimiter, RateDecision, RateLimiter, retry_after_secs};
pub use refresh::{SweepReport, refresh_cycle, spawn_refresh_task};
pub use registration::{IssuedTenantKey, NewTenant, Registrar, validate_subdomain};
pub use resolver::{TenantContext, TenantResolver, UpstreamCredential};
