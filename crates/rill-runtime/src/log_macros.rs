//! Domain-aware logging macros.
//!
//! Each macro injects a `domain` field so call sites stay consistent. The
//! domain is one of `sys`, `conn`, `pipe`, `res`, `conf`, given as a bare
//! identifier:
//!
//! ```ignore
//! rill_info!(sys, processor = %name, "processor started");
//! rill_warn!(pipe, error = %e, "dead-letter append failed");
//! rill_debug!(conn, peer = %peer, "accepted connection");
//! ```

#[doc(hidden)]
macro_rules! rill_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

macro_rules! rill_error {
    ($domain:ident, $($rest:tt)*) => {
        rill_log!(error, $domain, $($rest)*)
    };
}

macro_rules! rill_warn {
    ($domain:ident, $($rest:tt)*) => {
        rill_log!(warn, $domain, $($rest)*)
    };
}

macro_rules! rill_info {
    ($domain:ident, $($rest:tt)*) => {
        rill_log!(info, $domain, $($rest)*)
    };
}

macro_rules! rill_debug {
    ($domain:ident, $($rest:tt)*) => {
        rill_log!(debug, $domain, $($rest)*)
    };
}

#[allow(unused_macros)]
macro_rules! rill_trace {
    ($domain:ident, $($rest:tt)*) => {
        rill_log!(trace, $domain, $($rest)*)
    };
}
