//! Observability for the coordinator
//!
//! - Structured logging through `tracing`, installed once by the binary
//! - Fleet counters fed by a lifecycle event listener
//!
//! Library code only emits events; it never installs a subscriber.

mod metrics;

pub use metrics::{FleetMetrics, MetricsListener, MetricsSnapshot};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when neither `RUST_LOG` nor an explicit filter is given.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `filter`; an unparsable filter falls back to
/// [`DEFAULT_LOG_FILTER`]. Returns `false` if a subscriber was already
/// installed.
pub fn init_tracing(filter: Option<&str>, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or(DEFAULT_LOG_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .is_ok()
    }
}
