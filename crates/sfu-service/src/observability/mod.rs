//! Observability module for the SFU service.
//!
//! # Privacy by Default
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit fields. Room
//! keys and peer ids are logged; display names, chat text and media
//! parameters are not. Metric labels are bounded (see [`metrics`]).
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms with at least one peer |
//! | `sfu_peers_active` | Gauge | none | Joined peers |
//! | `sfu_workers_active` | Gauge | none | Live media workers |
//! | `sfu_routers_created_total` | Counter | none | Router creations |
//! | `sfu_worker_deaths_total` | Counter | none | Unexpected worker deaths |
//! | `sfu_signaling_requests_total` | Counter | `method`, `status` | Signaling outcomes |
//! | `sfu_signaling_latency_seconds` | Histogram | `method` | Request handling latency |
//! | `sfu_meeting_store_latency_seconds` | Histogram | `operation` | Meeting store latency |

pub mod health;
pub mod metrics;
pub mod stats;

pub use health::{health_router, HealthState};
pub use stats::{stats_router, ServiceStats};
pub use metrics::{
    init_metrics_recorder, record_meeting_store_latency, record_router_created,
    record_signaling_latency, record_signaling_request, record_worker_death, set_peers_active,
    set_rooms_active, set_workers_active,
};
