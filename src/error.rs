/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// D-Bus error name used when a readiness operation is handed an unsupported feature.
pub const TP_ERROR_INVALID_ARGUMENT: &str = "org.freedesktop.Telepathy.Error.InvalidArgument";
/// D-Bus error name used for dependency/interface gaps discovered during introspection.
pub const TP_ERROR_NOT_AVAILABLE: &str = "org.freedesktop.Telepathy.Error.NotAvailable";
/// D-Bus error name used when an operation is abandoned before it could resolve.
pub const TP_ERROR_CANCELLED: &str = "org.freedesktop.Telepathy.Error.Cancelled";
/// D-Bus error name used when a connection drops to `Disconnected`.
pub const TP_ERROR_DISCONNECTED: &str = "org.freedesktop.Telepathy.Error.Disconnected";
/// D-Bus error name used when a remote object disappears (channel closed, dispatch finished).
pub const TP_ERROR_OBJECT_REMOVED: &str = "org.freedesktop.Telepathy.Error.ObjectRemoved";

/// Error returned by telebus APIs.
///
/// Telepathy communicates failure as (error name, error message) pairs on the
/// wire. This enum keeps those pairs classifiable by variant while
/// [`Error::dbus_name`] / [`Error::from_dbus_pair`] convert to and from the
/// wire representation without losing the original name.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Input validation failure (e.g. unsupported feature, malformed client name).
    #[error("invalid argument: {context}")]
    InvalidArgument { context: String },

    /// Requested functionality cannot be provided (missing feature dependency,
    /// missing remote interface).
    #[error("not available: {context}")]
    NotAvailable { context: String },

    /// The owning proxy was invalidated; carries the invalidation pair verbatim.
    #[error("proxy invalidated {name}: {message}")]
    Invalidated { name: String, message: String },

    /// An operation was abandoned before resolution (helper or proxy destroyed).
    #[error("cancelled: {context}")]
    Cancelled { context: String },

    /// Raw D-Bus error that did not match a more specific classification.
    /// Introspection failures reported by remote calls are propagated here
    /// verbatim.
    #[error("dbus error {name}: {message}")]
    DbusError { name: String, message: String },

    /// Failed to extract an expected value from a D-Bus payload.
    #[error("parse error: {context}")]
    ParseError { context: String },

    /// Generic I/O or transport error with context.
    #[error("io error: {context}")]
    IoError { context: String },
}

impl Error {
    pub(crate) fn invalid_argument(context: impl Into<String>) -> Self {
        Self::InvalidArgument {
            context: context.into(),
        }
    }

    pub(crate) fn not_available(context: impl Into<String>) -> Self {
        Self::NotAvailable {
            context: context.into(),
        }
    }

    pub(crate) fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    pub(crate) fn parse_error(context: impl Into<String>) -> Self {
        Self::ParseError {
            context: context.into(),
        }
    }

    /// Classify a raw (error name, error message) pair, as carried by proxy
    /// invalidation records and introspection failures.
    pub fn from_dbus_pair(name: &str, message: &str) -> Self {
        match name {
            TP_ERROR_INVALID_ARGUMENT => Self::InvalidArgument {
                context: message.to_string(),
            },
            TP_ERROR_NOT_AVAILABLE => Self::NotAvailable {
                context: message.to_string(),
            },
            TP_ERROR_CANCELLED => Self::Cancelled {
                context: message.to_string(),
            },
            _ => Self::DbusError {
                name: name.to_string(),
                message: message.to_string(),
            },
        }
    }

    /// The D-Bus error name this error maps to.
    pub fn dbus_name(&self) -> &str {
        match self {
            Error::InvalidArgument { .. } => TP_ERROR_INVALID_ARGUMENT,
            Error::NotAvailable { .. } => TP_ERROR_NOT_AVAILABLE,
            Error::Invalidated { name, .. } => name,
            Error::Cancelled { .. } => TP_ERROR_CANCELLED,
            Error::DbusError { name, .. } => name,
            Error::ParseError { .. } | Error::IoError { .. } => "org.freedesktop.DBus.Error.Failed",
        }
    }

    /// The human-readable half of the (name, message) pair.
    pub fn dbus_message(&self) -> &str {
        match self {
            Error::InvalidArgument { context }
            | Error::NotAvailable { context }
            | Error::Cancelled { context }
            | Error::ParseError { context }
            | Error::IoError { context } => context,
            Error::Invalidated { message, .. } | Error::DbusError { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn classifies_known_error_names() {
        let err = Error::from_dbus_pair(TP_ERROR_NOT_AVAILABLE, "missing");
        let Error::NotAvailable { context } = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(context, "missing");
    }

    #[test]
    fn keeps_unknown_error_names_verbatim() {
        let err = Error::from_dbus_pair("im.example.Quirk", "odd");
        let Error::DbusError { name, message } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(name, "im.example.Quirk");
        assert_eq!(message, "odd");
        assert_eq!(err.dbus_name(), "im.example.Quirk");
    }

    #[test]
    fn round_trips_name_and_message() {
        let err = Error::invalid_argument("bad feature");
        assert_eq!(err.dbus_name(), TP_ERROR_INVALID_ARGUMENT);
        assert_eq!(err.dbus_message(), "bad feature");

        let back = Error::from_dbus_pair(err.dbus_name(), err.dbus_message());
        let Error::InvalidArgument { context } = back else {
            panic!("classification changed");
        };
        assert_eq!(context, "bad feature");
    }

    #[test]
    fn invalidated_keeps_original_name() {
        let err = Error::Invalidated {
            name: TP_ERROR_DISCONNECTED.to_string(),
            message: "connection lost".to_string(),
        };
        assert_eq!(err.dbus_name(), TP_ERROR_DISCONNECTED);
        assert_eq!(err.dbus_message(), "connection lost");
    }
}
