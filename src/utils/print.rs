//! Helper macros for logging (console printing).

/// Log TRACE message.
///
/// Example:
/// ```ignore
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_arg:tt)*) => {
        log::trace!($($fmt_arg)*)
    };
}

/// Log DEBUG message.
///
/// Example:
/// ```ignore
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_arg:tt)*) => {
        log::debug!($($fmt_arg)*)
    };
}

/// Log INFO message.
///
/// Example:
/// ```ignore
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($($fmt_arg:tt)*) => {
        log::info!($($fmt_arg)*)
    };
}

/// Log WARN message.
///
/// Example:
/// ```ignore
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_arg:tt)*) => {
        log::warn!($($fmt_arg)*)
    };
}

/// Log ERROR message.
///
/// Example:
/// ```ignore
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($($fmt_arg:tt)*) => {
        log::error!($($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `ProxyError` containing
/// the string. `ProxyError` must be in scope at the call site.
///
/// Example:
/// ```ignore
/// return logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal) => {
        {
            pf_error!($fmt_str);
            Err(ProxyError($fmt_str.into()))
        }
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($fmt_str, $($fmt_arg)*);
            Err(ProxyError(format!($fmt_str, $($fmt_arg)*)))
        }
    };
}
