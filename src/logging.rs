//! Logging and tracing infrastructure for fwflow.
//!
//! Structured logging via the tracing crate. Worker threads are named after
//! their stage, so thread names are included in the default text output.
//!
//! The filter comes from `FWFLOW_LOG`, then `RUST_LOG`. Without either, the
//! pipeline logs at info and third-party crates (plugins, unpackers) at warn;
//! per-item `work_item` spans only appear once `fwflow::scheduler` is at debug.

use std::sync::Once;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

static INIT: Once = Once::new();

/// Checked before `RUST_LOG`.
pub const LOG_ENV: &str = "FWFLOW_LOG";

pub const DEFAULT_FILTER: &str = "warn,fwflow=info";

fn filter_directives(fwflow_log: Option<String>, rust_log: Option<String>) -> String {
    fwflow_log
        .into_iter()
        .chain(rust_log)
        .find(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn env_filter() -> EnvFilter {
    let directives = filter_directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the global tracing subscriber.
///
/// This should be called once at program startup.
/// Subsequent calls are ignored, as are calls made after another
/// subscriber was installed elsewhere.
pub fn init_tracing() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);

        if tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init()
            .is_ok()
        {
            info!("fwflow tracing initialized");
        }
    });
}

/// Initialize tracing with JSON output for structured logging.
pub fn init_tracing_json() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_current_span(true);

        if tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init()
            .is_ok()
        {
            info!("fwflow tracing initialized (JSON mode)");
        }
    });
}

/// Span wrapping one WorkItem inside a stage worker.
#[macro_export]
macro_rules! stage_span {
    ($stage:expr, $item:expr) => {
        tracing::debug_span!("work_item", stage = %$stage, item = $item)
    };
    ($stage:expr, $item:expr, $($field:tt)*) => {
        tracing::debug_span!("work_item", stage = %$stage, item = $item, $($field)*)
    };
}
