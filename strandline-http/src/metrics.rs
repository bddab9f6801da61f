//! Client transport metrics.
//!
//! Process-wide counters for connection reuse, retries, breaker activity
//! and HTTP/2 negotiation outcomes. Exposed through any `metriken`
//! exporter the application registers.

use metriken::{Counter, Gauge, metric};

// ── Connections ──────────────────────────────────────────────────

#[metric(
    name = "strandline/connections/opened",
    description = "Total connections opened"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "strandline/connections/reused",
    description = "Total requests served on a pooled connection"
)]
pub static CONNECTIONS_REUSED: Counter = Counter::new();

#[metric(
    name = "strandline/connections/evicted",
    description = "Total connections closed instead of pooled"
)]
pub static CONNECTIONS_EVICTED: Counter = Counter::new();

#[metric(
    name = "strandline/connections/idle",
    description = "Connections currently idle in the pool"
)]
pub static CONNECTIONS_IDLE: Gauge = Gauge::new();

// ── Resilience ───────────────────────────────────────────────────

#[metric(name = "strandline/retries", description = "Total retried attempts")]
pub static RETRIES: Counter = Counter::new();

#[metric(
    name = "strandline/breaker/opened",
    description = "Total circuit breaker transitions to open"
)]
pub static BREAKER_OPENED: Counter = Counter::new();

#[metric(
    name = "strandline/breaker/rejected",
    description = "Total attempts rejected by an open circuit"
)]
pub static BREAKER_REJECTED: Counter = Counter::new();

// ── HTTP/2 negotiation ───────────────────────────────────────────

#[metric(
    name = "strandline/h2/downgrades",
    description = "Cleartext HTTP/2 attempts answered with HTTP/1.x"
)]
pub static H2_DOWNGRADES: Counter = Counter::new();

#[metric(
    name = "strandline/h2/fallbacks",
    description = "HTTP/2-preferring calls completed over HTTP/1.1"
)]
pub static H2_FALLBACKS: Counter = Counter::new();
