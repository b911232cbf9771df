use crate::bus::{
    self, TP_CLIENT_BUS_NAME_BASE, TP_CLIENT_OBJECT_PATH_BASE, TP_IFACE_CLIENT_APPROVER,
    TP_IFACE_CLIENT_HANDLER, TP_IFACE_CLIENT_OBSERVER,
};
use crate::channel::Channel;
use crate::dispatch::ChannelDispatchOperation;
use crate::error::{Error, Result};
use crate::fake_handler::FakeHandlerManager;
use crate::feature::Features;
use crate::util::{self, ChannelDetails, PropertyMap};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

/// One channel class filter entry: property name/value pairs a channel's
/// immutable properties must match for the client to be interested.
#[derive(Debug, Default)]
pub struct ChannelFilter {
    properties: PropertyMap,
}

impl ChannelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a matched property. Fails only for values that cannot be detached
    /// from their message (file descriptors, which never appear in filters).
    pub fn insert(mut self, key: impl Into<String>, value: Value<'_>) -> Result<Self> {
        let owned = value
            .try_to_owned()
            .map_err(|e| Error::invalid_argument(format!("unsupported filter value: {e}")))?;
        self.properties.insert(key.into(), owned);
        Ok(self)
    }

    fn to_map(&self) -> PropertyMap {
        self.properties
            .iter()
            .filter_map(|(key, value)| {
                OwnedValue::try_clone(value)
                    .ok()
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }
}

/// A client that monitors channels without influencing their dispatching.
pub trait Observer: Send + Sync + 'static {
    /// Channel classes this observer wants to see.
    fn observer_filter(&self) -> Vec<ChannelFilter>;

    /// Called with ready channel proxies for each observed batch, plus the
    /// dispatch operation when the channels were unrequested.
    fn observe_channels(
        &self,
        channels: Vec<Channel>,
        dispatch_operation: Option<ChannelDispatchOperation>,
    );
}

/// A client asked to approve or reject incoming channel batches.
pub trait Approver: Send + Sync + 'static {
    /// Channel classes this approver wants to rule on.
    fn approver_filter(&self) -> Vec<ChannelFilter>;

    /// Called with a ready dispatch operation; the approver answers by
    /// calling [`ChannelDispatchOperation::handle_with`] or
    /// [`ChannelDispatchOperation::claim`] on it.
    fn add_dispatch_operation(&self, operation: ChannelDispatchOperation);
}

/// A client that takes responsibility for channels assigned to it.
pub trait Handler: Send + Sync + 'static {
    /// Channel classes this handler can handle.
    fn handler_filter(&self) -> Vec<ChannelFilter>;

    /// Whether channels for this handler skip the approval stage.
    fn bypass_approval(&self) -> bool {
        false
    }

    /// Called with ready channel proxies the dispatcher assigned to this
    /// handler.
    fn handle_channels(&self, channels: Vec<Channel>);
}

#[derive(Clone, Copy, Debug)]
enum ClientRole {
    Observer,
    Approver,
    Handler,
}

impl ClientRole {
    fn interface(self) -> &'static str {
        match self {
            Self::Observer => TP_IFACE_CLIENT_OBSERVER,
            Self::Approver => TP_IFACE_CLIENT_APPROVER,
            Self::Handler => TP_IFACE_CLIENT_HANDLER,
        }
    }
}

struct RegisteredClient {
    object_path: OwnedObjectPath,
    role: ClientRole,
}

/// Exports client objects on the bus and claims their well-known names, so
/// the channel dispatcher can discover and call them.
#[derive(Clone)]
pub struct ClientRegistrar {
    inner: Arc<RegistrarInner>,
}

struct RegistrarInner {
    conn: zbus::Connection,
    clients: Mutex<HashMap<String, RegisteredClient>>,
}

impl ClientRegistrar {
    pub fn new(conn: zbus::Connection) -> Self {
        Self {
            inner: Arc::new(RegistrarInner {
                conn,
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `observer` under `name`. With `unique` set, a per-process
    /// suffix is appended so several instances can coexist on the bus.
    /// Returns the well-known bus name claimed for the client.
    pub async fn register_observer(
        &self,
        observer: Arc<dyn Observer>,
        name: &str,
        unique: bool,
    ) -> Result<String> {
        let adaptor = ObserverAdaptor {
            conn: self.inner.conn.clone(),
            observer,
        };
        self.register(name, unique, ClientRole::Observer, adaptor)
            .await
    }

    /// Register `approver` under `name`; see
    /// [`register_observer`](Self::register_observer).
    pub async fn register_approver(
        &self,
        approver: Arc<dyn Approver>,
        name: &str,
        unique: bool,
    ) -> Result<String> {
        let adaptor = ApproverAdaptor {
            conn: self.inner.conn.clone(),
            approver,
        };
        self.register(name, unique, ClientRole::Approver, adaptor)
            .await
    }

    /// Register `handler` under `name`; see
    /// [`register_observer`](Self::register_observer). Channels the handler
    /// accepts are reported through the client's `HandledChannels` property
    /// until they close.
    pub async fn register_handler(
        &self,
        handler: Arc<dyn Handler>,
        name: &str,
        unique: bool,
    ) -> Result<String> {
        let adaptor = HandlerAdaptor {
            conn: self.inner.conn.clone(),
            handler,
        };
        self.register(name, unique, ClientRole::Handler, adaptor)
            .await
    }

    /// Drop a registration made earlier: releases the bus name and removes
    /// the exported objects. The client stays registered until the teardown
    /// actually succeeded, so a failed unregister can be retried.
    pub async fn unregister(&self, bus_name: &str) -> Result<()> {
        let (object_path, role) = {
            let clients = self.inner.clients_lock();
            let Some(client) = clients.get(bus_name) else {
                return Err(Error::invalid_argument(
                    "no client registered under this bus name",
                ));
            };
            (client.object_path.clone(), client.role)
        };

        self.inner
            .conn
            .release_name(bus_name)
            .await
            .map_err(bus::map_zbus_error)?;

        let server = self.inner.conn.object_server();
        let path = object_path.as_str();
        match role {
            ClientRole::Observer => {
                server
                    .remove::<ObserverAdaptor, _>(path)
                    .await
                    .map_err(bus::map_zbus_error)?;
            }
            ClientRole::Approver => {
                server
                    .remove::<ApproverAdaptor, _>(path)
                    .await
                    .map_err(bus::map_zbus_error)?;
            }
            ClientRole::Handler => {
                server
                    .remove::<HandlerAdaptor, _>(path)
                    .await
                    .map_err(bus::map_zbus_error)?;
            }
        }
        server
            .remove::<ClientAdaptor, _>(path)
            .await
            .map_err(bus::map_zbus_error)?;
        self.inner.clients_lock().remove(bus_name);
        Ok(())
    }

    /// Bus names of the currently registered clients.
    pub fn registered_clients(&self) -> Vec<String> {
        self.inner.clients_lock().keys().cloned().collect()
    }

    async fn register<I>(
        &self,
        name: &str,
        unique: bool,
        role: ClientRole,
        adaptor: I,
    ) -> Result<String>
    where
        I: zbus::object_server::Interface,
    {
        util::validate_client_name(name)?;
        let client_name = if unique {
            format!("{name}.{}", unique_suffix())
        } else {
            name.to_string()
        };
        let bus_name = format!("{TP_CLIENT_BUS_NAME_BASE}{client_name}");
        if self.inner.clients_lock().contains_key(&bus_name) {
            return Err(Error::invalid_argument(
                "a client with this name is already registered",
            ));
        }
        let path_str = format!(
            "{TP_CLIENT_OBJECT_PATH_BASE}{}",
            client_name.replace('.', "/")
        );
        let object_path = OwnedObjectPath::try_from(path_str.as_str())
            .map_err(|e| Error::invalid_argument(format!("invalid client object path: {e}")))?;

        let server = self.inner.conn.object_server();
        let fresh = server
            .at(
                object_path.as_str(),
                ClientAdaptor {
                    interfaces: vec![role.interface().to_string()],
                },
            )
            .await
            .map_err(bus::map_zbus_error)?;
        if !fresh {
            return Err(Error::invalid_argument(
                "an object is already exported at this client path",
            ));
        }
        server
            .at(object_path.as_str(), adaptor)
            .await
            .map_err(bus::map_zbus_error)?;
        self.inner
            .conn
            .request_name(bus_name.as_str())
            .await
            .map_err(bus::map_zbus_error)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(bus_name = %bus_name, path = %object_path, ?role, "client registered");

        self.inner.clients_lock().insert(
            bus_name.clone(),
            RegisteredClient { object_path, role },
        );
        Ok(bus_name)
    }

    #[cfg(test)]
    fn insert_for_tests(&self, bus_name: &str, object_path: OwnedObjectPath, role: ClientRole) {
        self.inner
            .clients_lock()
            .insert(bus_name.to_string(), RegisteredClient { object_path, role });
    }
}

impl RegistrarInner {
    fn clients_lock(&self) -> MutexGuard<'_, HashMap<String, RegisteredClient>> {
        match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn unique_suffix() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let serial = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("n{}_{serial}", std::process::id())
}

fn into_fdo(err: Error) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

/// Build ready channel proxies from the (path, immutable properties) pairs
/// of a dispatcher call. The channels live on the connection's implied bus
/// name.
async fn prepare_channels(
    conn: &zbus::Connection,
    connection_path: &OwnedObjectPath,
    details: ChannelDetails,
) -> Result<Vec<Channel>> {
    let service = bus::service_name_for_path(connection_path.as_str());
    let mut channels = Vec::with_capacity(details.len());
    for (path, props) in details {
        let channel = Channel::with_properties(conn.clone(), service.as_str(), path.as_str(), props)?;
        channel.become_ready(Features::new()).await?;
        channels.push(channel);
    }
    Ok(channels)
}

async fn prepare_dispatch_operation(
    conn: &zbus::Connection,
    path: &OwnedObjectPath,
    properties: PropertyMap,
    channels: Option<ChannelDetails>,
) -> Result<ChannelDispatchOperation> {
    let operation = ChannelDispatchOperation::with_details(
        conn.clone(),
        bus::TP_CHANNEL_DISPATCHER_DESTINATION,
        path.as_str(),
        properties,
        channels,
    )?;
    operation.become_ready(Features::new()).await?;
    Ok(operation)
}

fn filters_to_wire(filters: &[ChannelFilter]) -> Vec<PropertyMap> {
    filters.iter().map(ChannelFilter::to_map).collect()
}

/// The common `org.freedesktop.Telepathy.Client` face of every exported
/// client object.
struct ClientAdaptor {
    interfaces: Vec<String>,
}

#[zbus::interface(name = "org.freedesktop.Telepathy.Client")]
impl ClientAdaptor {
    #[zbus(property, name = "Interfaces")]
    fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }
}

struct ObserverAdaptor {
    conn: zbus::Connection,
    observer: Arc<dyn Observer>,
}

#[zbus::interface(name = "org.freedesktop.Telepathy.Client.Observer")]
impl ObserverAdaptor {
    #[zbus(property, name = "ObserverChannelFilter")]
    fn observer_channel_filter(&self) -> Vec<PropertyMap> {
        filters_to_wire(&self.observer.observer_filter())
    }

    #[allow(clippy::too_many_arguments)]
    async fn observe_channels(
        &self,
        _account: OwnedObjectPath,
        connection: OwnedObjectPath,
        channels: ChannelDetails,
        dispatch_operation: OwnedObjectPath,
        _requests_satisfied: Vec<OwnedObjectPath>,
        _observer_info: PropertyMap,
    ) -> zbus::fdo::Result<()> {
        let channels = prepare_channels(&self.conn, &connection, channels)
            .await
            .map_err(into_fdo)?;
        let operation = if dispatch_operation.as_str() == "/" {
            None
        } else {
            Some(
                prepare_dispatch_operation(
                    &self.conn,
                    &dispatch_operation,
                    PropertyMap::new(),
                    None,
                )
                .await
                .map_err(into_fdo)?,
            )
        };
        self.observer.observe_channels(channels, operation);
        Ok(())
    }
}

struct ApproverAdaptor {
    conn: zbus::Connection,
    approver: Arc<dyn Approver>,
}

#[zbus::interface(name = "org.freedesktop.Telepathy.Client.Approver")]
impl ApproverAdaptor {
    #[zbus(property, name = "ApproverChannelFilter")]
    fn approver_channel_filter(&self) -> Vec<PropertyMap> {
        filters_to_wire(&self.approver.approver_filter())
    }

    async fn add_dispatch_operation(
        &self,
        channels: ChannelDetails,
        dispatch_operation: OwnedObjectPath,
        properties: PropertyMap,
    ) -> zbus::fdo::Result<()> {
        let operation = prepare_dispatch_operation(
            &self.conn,
            &dispatch_operation,
            properties,
            Some(channels),
        )
        .await
        .map_err(into_fdo)?;
        self.approver.add_dispatch_operation(operation);
        Ok(())
    }
}

struct HandlerAdaptor {
    conn: zbus::Connection,
    handler: Arc<dyn Handler>,
}

#[zbus::interface(name = "org.freedesktop.Telepathy.Client.Handler")]
impl HandlerAdaptor {
    #[zbus(property, name = "HandlerChannelFilter")]
    fn handler_channel_filter(&self) -> Vec<PropertyMap> {
        filters_to_wire(&self.handler.handler_filter())
    }

    #[zbus(property, name = "BypassApproval")]
    fn bypass_approval(&self) -> bool {
        self.handler.bypass_approval()
    }

    #[zbus(property, name = "HandledChannels")]
    fn handled_channels(&self) -> Vec<OwnedObjectPath> {
        self.conn
            .unique_name()
            .map(|name| FakeHandlerManager::instance().handled_channels(name.as_str()))
            .unwrap_or_default()
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_channels(
        &self,
        _account: OwnedObjectPath,
        connection: OwnedObjectPath,
        channels: ChannelDetails,
        _requests_satisfied: Vec<OwnedObjectPath>,
        _user_action_time: u64,
        _handler_info: PropertyMap,
    ) -> zbus::fdo::Result<()> {
        let channels = prepare_channels(&self.conn, &connection, channels)
            .await
            .map_err(into_fdo)?;
        if let Some(unique) = self.conn.unique_name() {
            FakeHandlerManager::instance()
                .register_channels(unique.as_str(), channels.iter().map(Channel::tracked));
        }
        self.handler.handle_channels(channels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn filters_survive_the_wire_conversion() {
        let filter = ChannelFilter::new()
            .insert(
                "org.freedesktop.Telepathy.Channel.ChannelType",
                Value::from("org.freedesktop.Telepathy.Channel.Type.Text"),
            )
            .expect("string value")
            .insert("org.freedesktop.Telepathy.Channel.Requested", Value::Bool(false))
            .expect("bool value");

        let wire = filters_to_wire(&[filter]);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].len(), 2);
        assert!(wire[0].contains_key("org.freedesktop.Telepathy.Channel.ChannelType"));
    }

    #[test]
    fn unique_suffixes_are_valid_name_elements_and_distinct() {
        let a = unique_suffix();
        let b = unique_suffix();
        assert_ne!(a, b);
        util::validate_client_name(&a).expect("valid element");
    }

    // A teardown that fails partway must not forget the client, otherwise the
    // claimed name and exported objects can never be retried.
    #[cfg(feature = "rt-async-io")]
    #[test]
    fn failed_teardown_keeps_the_client_registered() {
        smol::block_on(async {
            let (left, right) = std::os::unix::net::UnixStream::pair().expect("socketpair");
            let server = zbus::connection::Builder::unix_stream(left)
                .server(zbus::Guid::generate())
                .expect("server builder")
                .p2p()
                .build();
            let client = zbus::connection::Builder::unix_stream(right).p2p().build();
            let (conn, peer) = futures_util::try_join!(client, server).expect("p2p pair");
            // With the peer gone every bus call fails.
            drop(peer);

            let bus_name = "org.freedesktop.Telepathy.Client.Ferret";
            let registrar = ClientRegistrar::new(conn);
            registrar.insert_for_tests(
                bus_name,
                OwnedObjectPath::try_from("/org/freedesktop/Telepathy/Client/Ferret")
                    .expect("client path"),
                ClientRole::Handler,
            );

            assert!(registrar.unregister(bus_name).await.is_err());
            assert_eq!(registrar.registered_clients(), vec![bus_name.to_string()]);
        });
    }

    #[test]
    fn roles_map_to_their_client_interfaces() {
        assert_eq!(
            ClientRole::Observer.interface(),
            "org.freedesktop.Telepathy.Client.Observer"
        );
        assert_eq!(
            ClientRole::Approver.interface(),
            "org.freedesktop.Telepathy.Client.Approver"
        );
        assert_eq!(
            ClientRole::Handler.interface(),
            "org.freedesktop.Telepathy.Client.Handler"
        );
    }
}
