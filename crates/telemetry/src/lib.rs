//! Structured JSON logging for the PIV object store workspace.
//!
//! The core crates (`piv-device`, `piv-store`, `piv-orchestrator`) only emit
//! `tracing` spans and events; they never configure a subscriber themselves.
//! A binary embedding this workspace calls [`init_json_logging`] once at
//! startup, exactly as the OTel exporter half of telemetry setup would be
//! wired in a larger deployment — this crate ships only the logging half,
//! since device enumeration, metrics backends and OTel export are external
//! collaborators per the core's scope.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize structured JSON logging with an env filter.
///
/// Set `RUST_LOG`, e.g. `"info,piv_store=debug"`. Safe to call more than
/// once; only the first call's subscriber wins, later calls are ignored.
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
