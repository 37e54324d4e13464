//! Logging macros and the global subscriber.
//!
//! Events are recorded inside a span named after where they come from:
//! `incoming` for what a peer sent us, `outgoing` for what we sent a peer and
//! `internal` for the rest.

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable holding the maximum level to record
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

#[doc(hidden)]
#[macro_export]
macro_rules! __event_in_span {
    ($level:expr, $span:literal, $($msg:tt)+) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)+)
    }};
}

/// Traffic written to a peer
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::__event_in_span!($crate::tracing::Level::$level, "outgoing", $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::outgoing!(level = TRACE, $($msg)+)
    };
}

/// Traffic read from a peer
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::__event_in_span!($crate::tracing::Level::$level, "incoming", $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::incoming!(level = TRACE, $($msg)+)
    };
}

/// Anything that is not peer traffic, `TRACE` unless a level is given
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::__event_in_span!($crate::tracing::Level::$level, "internal", $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::internal!(level = TRACE, $($msg)+)
    };
}

const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// The configured level, or the build default when `configured` is missing
/// or not a level
fn level(configured: Option<&str>) -> Result<LevelFilter, String> {
    configured.map_or(Ok(default_level()), |value| {
        LevelFilter::from_str(value.trim()).map_err(|_| value.to_string())
    })
}

/// Install the global subscriber.
///
/// The level comes from `LOG_LEVEL`, defaulting to `TRACE` for debug builds
/// and `INFO` for release builds. Events from outside the postern crates are
/// dropped.
pub fn init() {
    let configured = std::env::var(LOG_LEVEL_ENV).ok();
    let level = level(configured.as_deref()).unwrap_or_else(|invalid| {
        eprintln!(
            "Invalid log level specified {invalid}, defaulting to {}",
            default_level()
        );
        default_level()
    });

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("postern")
                })),
        )
        .init();
}
