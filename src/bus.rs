use crate::error::Error;

pub(crate) const TP_IFACE_CONNECTION: &str = "org.freedesktop.Telepathy.Connection";
pub(crate) const TP_IFACE_CONNECTION_SIMPLE_PRESENCE: &str =
    "org.freedesktop.Telepathy.Connection.Interface.SimplePresence";
pub(crate) const TP_IFACE_CONNECTION_CONTACT_LIST: &str =
    "org.freedesktop.Telepathy.Connection.Interface.ContactList";
pub(crate) const TP_IFACE_CONNECTION_CONTACT_GROUPS: &str =
    "org.freedesktop.Telepathy.Connection.Interface.ContactGroups";

pub(crate) const TP_IFACE_CHANNEL: &str = "org.freedesktop.Telepathy.Channel";
pub(crate) const TP_IFACE_CHANNEL_GROUP: &str =
    "org.freedesktop.Telepathy.Channel.Interface.Group";

pub(crate) const TP_IFACE_ACCOUNT: &str = "org.freedesktop.Telepathy.Account";
pub(crate) const TP_ACCOUNT_MANAGER_DESTINATION: &str =
    "org.freedesktop.Telepathy.AccountManager";

pub(crate) const TP_IFACE_CHANNEL_DISPATCH_OPERATION: &str =
    "org.freedesktop.Telepathy.ChannelDispatchOperation";
pub(crate) const TP_CHANNEL_DISPATCHER_DESTINATION: &str =
    "org.freedesktop.Telepathy.ChannelDispatcher";

pub(crate) const TP_IFACE_CLIENT_OBSERVER: &str = "org.freedesktop.Telepathy.Client.Observer";
pub(crate) const TP_IFACE_CLIENT_APPROVER: &str = "org.freedesktop.Telepathy.Client.Approver";
pub(crate) const TP_IFACE_CLIENT_HANDLER: &str = "org.freedesktop.Telepathy.Client.Handler";
pub(crate) const TP_CLIENT_BUS_NAME_BASE: &str = "org.freedesktop.Telepathy.Client.";
pub(crate) const TP_CLIENT_OBJECT_PATH_BASE: &str = "/org/freedesktop/Telepathy/Client/";

pub(crate) const DBUS_PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// The bus name a Telepathy object path implies: connection objects live on
/// the service whose name is their path with `/` swapped for `.`.
pub(crate) fn service_name_for_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', ".")
}

/// Map a zbus transport error to the crate error model, keeping remote
/// (error name, message) pairs verbatim so introspection failures propagate
/// unmodified.
pub(crate) fn map_zbus_error(err: zbus::Error) -> Error {
    match err {
        zbus::Error::MethodError(name, detail, _reply) => {
            Error::from_dbus_pair(name.as_str(), detail.as_deref().unwrap_or_default())
        }
        zbus::Error::InputOutput(e) => Error::IoError {
            context: format!("dbus io error: {e}"),
        },
        other => Error::IoError {
            context: format!("dbus error: {other}"),
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;

    fn dummy_msg() -> zbus::Message {
        zbus::Message::method_call("/org/freedesktop/Telepathy/Connection", "Dummy")
            .expect("builder")
            .build(&())
            .expect("msg")
    }

    #[test]
    fn keeps_method_error_pair_verbatim() {
        let name = zbus::names::OwnedErrorName::try_from(
            "org.freedesktop.Telepathy.Error.NotYours",
        )
        .expect("name");
        let err = zbus::Error::MethodError(name, Some("claimed elsewhere".to_string()), dummy_msg());

        let mapped = map_zbus_error(err);
        let Error::DbusError { name, message } = mapped else {
            panic!("unexpected error: {mapped:?}");
        };
        assert_eq!(name, "org.freedesktop.Telepathy.Error.NotYours");
        assert_eq!(message, "claimed elsewhere");
    }

    #[test]
    fn derives_service_name_from_object_path() {
        assert_eq!(
            service_name_for_path("/org/freedesktop/Telepathy/Connection/gabble/jabber/alice"),
            "org.freedesktop.Telepathy.Connection.gabble.jabber.alice"
        );
    }

    #[test]
    fn maps_io_errors_with_context() {
        let err = zbus::Error::InputOutput(Arc::new(std::io::Error::other("gone")));
        let mapped = map_zbus_error(err);
        let Error::IoError { context } = mapped else {
            panic!("unexpected error: {mapped:?}");
        };
        assert!(context.contains("gone"));
    }
}
