use crate::bus::{TP_IFACE_CONNECTION, TP_IFACE_CONNECTION_SIMPLE_PRESENCE};
use crate::contacts::ContactManager;
use crate::error::{Error, Result, TP_ERROR_DISCONNECTED};
use crate::feature::{Feature, Features, Introspectable, Introspectables};
use crate::pending::PendingReady;
use crate::proxy::ProxyCore;
use crate::readiness::ReadinessHelper;
use crate::tasks::TaskSet;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::StreamExt;

/// Connection status as published by connection managers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl ConnectionStatus {
    pub fn from_u32(status: u32) -> Option<Self> {
        match status {
            0 => Some(Self::Connected),
            1 => Some(Self::Connecting),
            2 => Some(Self::Disconnected),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Connected => 0,
            Self::Connecting => 1,
            Self::Disconnected => 2,
        }
    }
}

/// Per-status availability record from the SimplePresence interface:
/// (presence type, may be set on self, may carry a message).
pub type PresenceStatuses = HashMap<String, (u32, bool, bool)>;

/// Proxy for a connection object of a Telepathy connection manager.
///
/// The connection's status is unknown until the core feature's first
/// introspection run discovers it; thereafter `StatusChanged` signals drive
/// the readiness engine's status epochs. A transition to disconnected
/// invalidates the proxy (and its [`ContactManager`]) rather than starting
/// another epoch.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    core: ProxyCore,
    helper: ReadinessHelper,
    contacts: ContactManager,
    details: Mutex<Details>,
    tasks: TaskSet,
}

#[derive(Default)]
struct Details {
    self_id: Option<String>,
    presence_statuses: Option<PresenceStatuses>,
}

impl Connection {
    /// Status value used before the remote status has been discovered.
    pub const STATUS_UNKNOWN: u32 = u32::MAX;

    /// Discovers the connection's status and interface list. Required by
    /// every other connection feature.
    pub const FEATURE_CORE: Feature = Feature::critical("Connection", 0);
    /// The identifier the connection manager assigned to the local user.
    pub const FEATURE_SELF_CONTACT: Feature = Feature::new("Connection", 1);
    /// The presence statuses the protocol supports.
    pub const FEATURE_SIMPLE_PRESENCE: Feature = Feature::new("Connection", 2);

    pub fn new(
        conn: zbus::Connection,
        bus_name: impl Into<String>,
        object_path: &str,
    ) -> Result<Self> {
        let core = ProxyCore::new(conn, bus_name, object_path)?;
        let helper = ReadinessHelper::new(
            core.validity(),
            Self::STATUS_UNKNOWN,
            Introspectables::new(),
        );
        let contacts = ContactManager::new(core.clone());
        let inner = Arc::new(ConnectionInner {
            core,
            helper,
            contacts,
            details: Mutex::new(Details::default()),
            tasks: TaskSet::new(),
        });

        inner.helper.add_introspectables(Self::introspectables(&inner));
        ConnectionInner::spawn_status_watch(&inner);
        // Core introspection starts as soon as the scheduler runs; explicit
        // become_ready calls for the core feature join this operation.
        let _core = inner.helper.become_ready(HashSet::from([Self::FEATURE_CORE]));
        Ok(Self { inner })
    }

    fn introspectables(inner: &Arc<ConnectionInner>) -> Introspectables {
        let all_statuses = [
            Self::STATUS_UNKNOWN,
            ConnectionStatus::Connected.as_u32(),
            ConnectionStatus::Connecting.as_u32(),
            ConnectionStatus::Disconnected.as_u32(),
        ];
        let connected = [ConnectionStatus::Connected.as_u32()];

        let mut introspectables = Introspectables::new();

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_CORE,
            Introspectable::new(all_statuses, Features::new(), Vec::<String>::new(), move |helper| {
                ConnectionInner::dispatch(&weak, "connection-core-introspect", move |inner| async move {
                    let result = inner.introspect_core(&helper).await;
                    helper.set_introspect_completed(&Connection::FEATURE_CORE, result);
                });
            })
            .critical(),
        );

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_SELF_CONTACT,
            Introspectable::new(
                connected,
                HashSet::from([Self::FEATURE_CORE]),
                Vec::<String>::new(),
                move |helper| {
                    ConnectionInner::dispatch(&weak, "connection-self-contact-introspect", move |inner| async move {
                        let result = inner.introspect_self_contact().await;
                        helper.set_introspect_completed(&Connection::FEATURE_SELF_CONTACT, result);
                    });
                },
            ),
        );

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_SIMPLE_PRESENCE,
            Introspectable::new(
                connected,
                HashSet::from([Self::FEATURE_CORE]),
                [TP_IFACE_CONNECTION_SIMPLE_PRESENCE],
                move |helper| {
                    ConnectionInner::dispatch(&weak, "connection-presence-introspect", move |inner| async move {
                        let result = inner.introspect_simple_presence().await;
                        helper.set_introspect_completed(&Connection::FEATURE_SIMPLE_PRESENCE, result);
                    });
                },
            ),
        );

        introspectables
    }

    /// Request readiness of `features`; an empty set means the core feature.
    pub fn become_ready(&self, features: Features) -> PendingReady {
        let features = if features.is_empty() {
            HashSet::from([Self::FEATURE_CORE])
        } else {
            features
        };
        self.inner.helper.become_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.inner.helper.is_ready(features)
    }

    pub fn actual_features(&self) -> Features {
        self.inner.helper.actual_features()
    }

    pub fn missing_features(&self) -> Features {
        self.inner.helper.missing_features()
    }

    pub fn missing_feature_error(&self, feature: &Feature) -> Option<Error> {
        self.inner.helper.missing_feature_error(feature)
    }

    /// The raw status value, [`Self::STATUS_UNKNOWN`] before discovery.
    pub fn status(&self) -> u32 {
        self.inner.helper.current_status()
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        ConnectionStatus::from_u32(self.status())
    }

    /// Interfaces the remote connection implements, known once the core
    /// feature is ready.
    pub fn interfaces(&self) -> Vec<String> {
        self.inner.helper.interfaces()
    }

    /// The local user's identifier, available once
    /// [`Self::FEATURE_SELF_CONTACT`] is ready.
    pub fn self_id(&self) -> Option<String> {
        self.inner.details_lock().self_id.clone()
    }

    /// Presence statuses the protocol supports, available once
    /// [`Self::FEATURE_SIMPLE_PRESENCE`] is ready.
    pub fn presence_statuses(&self) -> Option<PresenceStatuses> {
        self.inner.details_lock().presence_statuses.clone()
    }

    pub fn contact_manager(&self) -> ContactManager {
        self.inner.contacts.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.core.is_valid()
    }

    pub fn invalidation(&self) -> Option<(String, String)> {
        self.inner.core.invalidation()
    }

    pub fn bus_name(&self) -> &str {
        self.inner.core.bus_name()
    }

    pub fn object_path(&self) -> &str {
        self.inner.core.object_path()
    }
}

impl ConnectionInner {
    /// Upgrade-and-spawn shim shared by all introspect callbacks: no task is
    /// created once the proxy has been dropped.
    fn dispatch<F, Fut>(weak: &Weak<Self>, name: &str, work: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let fut = work(inner.clone());
        inner.spawn(fut, name);
    }

    fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static, name: &str) {
        let task = self.core.connection().executor().spawn(fut, name);
        self.tasks.insert(name, task);
    }

    async fn introspect_core(&self, helper: &ReadinessHelper) -> Result<()> {
        let mut props = self.core.get_all(TP_IFACE_CONNECTION).await?;
        let interfaces = crate::util::take_string_list(&mut props, "Interfaces")?;
        let status = crate::util::take_u32(&mut props, "Status")?;

        helper.set_interfaces(interfaces.clone());
        self.contacts.link_interfaces(interfaces);
        // A StatusChanged signal observed during the fetch wins over the
        // snapshot; only fill in the status while it is still unknown.
        if helper.current_status() == Connection::STATUS_UNKNOWN {
            helper.force_current_status(status);
            self.contacts.force_status(status);
        }
        Ok(())
    }

    async fn introspect_self_contact(&self) -> Result<()> {
        let value = self.core.get_property(TP_IFACE_CONNECTION, "SelfID").await?;
        let self_id = String::try_from(value)
            .map_err(|e| Error::parse_error(format!("SelfID has unexpected type: {e}")))?;
        self.details_lock().self_id = Some(self_id);
        Ok(())
    }

    async fn introspect_simple_presence(&self) -> Result<()> {
        let value = self
            .core
            .get_property(TP_IFACE_CONNECTION_SIMPLE_PRESENCE, "Statuses")
            .await?;
        let statuses = PresenceStatuses::try_from(value)
            .map_err(|e| Error::parse_error(format!("Statuses has unexpected type: {e}")))?;
        self.details_lock().presence_statuses = Some(statuses);
        Ok(())
    }

    fn spawn_status_watch(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let conn = inner.core.connection().clone();
        let bus_name = inner.core.bus_name().to_string();
        let path = inner.core.object_path().to_string();

        inner.spawn(
            async move {
                let proxy =
                    match zbus::Proxy::new(&conn, bus_name, path, TP_IFACE_CONNECTION).await {
                        Ok(proxy) => proxy,
                        Err(_err) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %_err, "failed to watch StatusChanged");
                            return;
                        }
                    };
                let mut stream = match proxy.receive_signal("StatusChanged").await {
                    Ok(stream) => stream,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch StatusChanged");
                        return;
                    }
                };
                while let Some(msg) = stream.next().await {
                    let Ok((status, reason)) = msg.body().deserialize::<(u32, u32)>() else {
                        continue;
                    };
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.apply_status_change(status, reason);
                }
            },
            "connection-status-watch",
        );
    }

    fn apply_status_change(&self, status: u32, reason: u32) {
        #[cfg(feature = "tracing")]
        tracing::debug!(status, reason, "connection status changed");

        if status == ConnectionStatus::Disconnected.as_u32() {
            let message = format!("connection became disconnected (reason {reason})");
            if self.core.validity().invalidate(TP_ERROR_DISCONNECTED, &message) {
                self.helper.notify_invalidated(TP_ERROR_DISCONNECTED, &message);
                self.contacts.notify_invalidated(TP_ERROR_DISCONNECTED, &message);
            }
            return;
        }
        self.helper.set_current_status(status);
        self.contacts.set_status(status);
    }

    fn details_lock(&self) -> MutexGuard<'_, Details> {
        match self.details.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
