//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for msgrelay.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProxyError(pub String);

impl ProxyError {
    /// Creates an error from anything displayable.
    pub fn msg(m: impl ToString) -> Self {
        ProxyError(m.to_string())
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ProxyError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ProxyError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ProxyError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::num::ParseIntError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::mpsc::error::SendError<String>);
