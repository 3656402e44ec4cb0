//! Shared test setup for the pipeliner crates.
// Standard lints
#![warn(missing_docs)]
#![deny(clippy::await_holding_lock)]
#![forbid(unsafe_code)]

use std::{collections::HashSet, sync::Once, time::Duration};

use once_cell::sync::Lazy;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// A multi-threaded Tokio runtime that can be shared between tests.
///
/// Use this runtime in tests that need a pipeliner to outlive a single test,
/// for example a shared global pipeliner. Pipeliner workers are stopped when
/// their runtime is shut down.
///
/// A shared runtime should not be used in tests that pause the Tokio timer,
/// because other tests could be using the runtime at the same time.
pub static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime")
});

/// A generous bound for tests that check an operation finishes,
/// without depending on precise timing.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Backtrace frames from these crates are hidden in test error reports.
const HIDDEN_FRAME_PREFIXES: &[&str] = &[
    "tokio::",
    "<futures_util::",
    "std::panic",
    "core::ops::function::FnOnce::call_once",
    "<core::future::",
    "<alloc::boxed::Box",
    "<std::panic::AssertUnwindSafe",
    "<tracing_futures::Instrumented",
    "<tracing::instrument::Instrumented",
    "test::",
];

static INIT: Once = Once::new();

/// Initialize globals for tests such as the tracing subscriber and panic / error
/// reporting hooks
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer().with_target(false).with_test_writer();
        // Use the RUST_LOG env var, or by default:
        //  - warn for most tests, and
        //  - hide the expected warnings from batch function panic tests
        let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new("warn")
                .unwrap()
                .add_directive("tower_pipeliner=error".parse().unwrap())
        });

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .init();

        color_eyre::config::HookBuilder::default()
            .add_frame_filter(Box::new(|frames| {
                let mut displayed = HashSet::new();

                frames.retain(|frame| {
                    // Skip frames we've already shown, for example in recursive futures.
                    if !displayed.insert((frame.lineno, frame.filename.clone())) {
                        return false;
                    }

                    let Some(name) = frame.name.as_deref() else {
                        return true;
                    };

                    !HIDDEN_FRAME_PREFIXES
                        .iter()
                        .any(|prefix| name.starts_with(prefix))
                });
            }))
            .install()
            .unwrap();
    })
}
