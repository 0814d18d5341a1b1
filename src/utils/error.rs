//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Quoral.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct QuoralError(pub String);

impl QuoralError {
    /// Creates an error out of anything that can be turned into a string.
    pub fn msg(m: impl ToString) -> Self {
        QuoralError(m.to_string())
    }
}

impl fmt::Display for QuoralError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for QuoralError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `QuoralError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for QuoralError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                QuoralError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);
