//! Helper macros for logging (console printing).

/// Log TRACE message.
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

/// Log an error message to the logger, then make and return a `QuoralError`
/// containing the same message.
///
/// Example:
/// ```no_run
/// use quoral::{logged_err, QuoralError};
///
/// fn check() -> Result<(), QuoralError> {
///     return logged_err!("got {} problems", 99);
/// }
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        $crate::pf_error!($($arg)*);
        Err($crate::utils::QuoralError(format!($($arg)*)))
    }};
}
