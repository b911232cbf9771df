use crate::bus::{self, TP_IFACE_CHANNEL_DISPATCH_OPERATION};
use crate::channel::Channel;
use crate::error::{Error, Result, TP_ERROR_OBJECT_REMOVED};
use crate::feature::{Feature, Features, Introspectable, Introspectables};
use crate::pending::PendingReady;
use crate::proxy::ProxyCore;
use crate::readiness::ReadinessHelper;
use crate::tasks::TaskSet;
use crate::util::{self, ChannelDetails, PropertyMap};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use zbus::zvariant::OwnedObjectPath;

const DISPATCH_STATUS: u32 = 0;

/// Proxy for a channel dispatch operation: an unrequested channel batch the
/// channel dispatcher is asking approvers about.
///
/// When the dispatcher's `AddDispatchOperation` call already carries the
/// operation's properties and channel list, the core feature becomes ready
/// without calling back into the dispatcher. The remote `Finished` signal
/// invalidates the proxy.
#[derive(Clone)]
pub struct ChannelDispatchOperation {
    inner: Arc<DispatchInner>,
}

struct DispatchInner {
    core: ProxyCore,
    helper: ReadinessHelper,
    state: Mutex<DispatchState>,
    tasks: TaskSet,
}

#[derive(Default)]
struct DispatchState {
    immutable: PropertyMap,
    account_path: Option<OwnedObjectPath>,
    connection_path: Option<OwnedObjectPath>,
    possible_handlers: Vec<String>,
    channels: Vec<Channel>,
    channels_known: bool,
}

impl ChannelDispatchOperation {
    /// Discovers the operation's account, connection, channels and handler
    /// candidates.
    pub const FEATURE_CORE: Feature = Feature::critical("ChannelDispatchOperation", 0);

    pub fn new(
        conn: zbus::Connection,
        bus_name: impl Into<String>,
        object_path: &str,
    ) -> Result<Self> {
        Self::with_details(conn, bus_name, object_path, PropertyMap::new(), None)
    }

    /// Construct an operation whose properties (and possibly channel list)
    /// were supplied by the dispatcher call that announced it.
    pub(crate) fn with_details(
        conn: zbus::Connection,
        bus_name: impl Into<String>,
        object_path: &str,
        immutable: PropertyMap,
        channels: Option<ChannelDetails>,
    ) -> Result<Self> {
        let core = ProxyCore::new(conn, bus_name, object_path)?;
        let helper = ReadinessHelper::new(core.validity(), DISPATCH_STATUS, Introspectables::new());

        let mut state = DispatchState {
            immutable: normalize_immutable(immutable),
            ..DispatchState::default()
        };
        if let Some(details) = channels {
            state.channels = build_channels(core.connection(), details)?;
            state.channels_known = true;
        }

        let inner = Arc::new(DispatchInner {
            core,
            helper,
            state: Mutex::new(state),
            tasks: TaskSet::new(),
        });
        inner.helper.add_introspectables(Self::introspectables(&inner));
        DispatchInner::spawn_finished_watch(&inner);
        let _core = inner.helper.become_ready(HashSet::from([Self::FEATURE_CORE]));
        Ok(Self { inner })
    }

    fn introspectables(inner: &Arc<DispatchInner>) -> Introspectables {
        let mut introspectables = Introspectables::new();
        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_CORE,
            Introspectable::new(
                [DISPATCH_STATUS],
                Features::new(),
                Vec::<String>::new(),
                move |helper| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let fut = {
                        let inner = inner.clone();
                        async move {
                            let result = inner.introspect_core(&helper).await;
                            helper.set_introspect_completed(
                                &ChannelDispatchOperation::FEATURE_CORE,
                                result,
                            );
                        }
                    };
                    let task = inner
                        .core
                        .connection()
                        .executor()
                        .spawn(fut, "dispatch-core-introspect");
                    inner.tasks.insert("dispatch-core-introspect", task);
                },
            )
            .critical(),
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

    pub fn missing_feature_error(&self, feature: &Feature) -> Option<Error> {
        self.inner.helper.missing_feature_error(feature)
    }

    /// Path of the account the channels belong to.
    pub fn account_path(&self) -> Option<OwnedObjectPath> {
        self.inner.state_lock().account_path.clone()
    }

    /// Path of the connection the channels belong to.
    pub fn connection_path(&self) -> Option<OwnedObjectPath> {
        self.inner.state_lock().connection_path.clone()
    }

    /// Well-known bus names of the handlers the dispatcher considers able to
    /// handle these channels.
    pub fn possible_handlers(&self) -> Vec<String> {
        self.inner.state_lock().possible_handlers.clone()
    }

    /// The channels awaiting dispatch.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.state_lock().channels.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.core.is_valid()
    }

    pub fn invalidation(&self) -> Option<(String, String)> {
        self.inner.core.invalidation()
    }

    pub fn object_path(&self) -> &str {
        self.inner.core.object_path()
    }

    /// Ask the dispatcher to hand the channels to `handler` (a well-known
    /// client bus name, or the empty string for "any suitable handler").
    pub async fn handle_with(&self, handler: &str) -> Result<()> {
        let proxy = self
            .inner
            .core
            .interface_proxy(TP_IFACE_CHANNEL_DISPATCH_OPERATION)
            .await?;
        proxy
            .call::<_, _, ()>("HandleWith", &(handler))
            .await
            .map_err(bus::map_zbus_error)
    }

    /// Claim the channels for the calling process, bypassing handlers.
    pub async fn claim(&self) -> Result<()> {
        let proxy = self
            .inner
            .core
            .interface_proxy(TP_IFACE_CHANNEL_DISPATCH_OPERATION)
            .await?;
        proxy
            .call::<_, _, ()>("Claim", &())
            .await
            .map_err(bus::map_zbus_error)
    }
}

impl DispatchInner {
    async fn introspect_core(&self, helper: &ReadinessHelper) -> Result<()> {
        let cached = {
            let mut state = self.state_lock();
            let complete = state.immutable.contains_key("Account")
                && state.immutable.contains_key("Connection")
                && (state.channels_known || state.immutable.contains_key("Channels"));
            complete.then(|| std::mem::take(&mut state.immutable))
        };
        let mut props = match cached {
            Some(props) => props,
            None => self.core.get_all(TP_IFACE_CHANNEL_DISPATCH_OPERATION).await?,
        };

        let account = util::take_path(&mut props, "Account")?;
        let connection = util::take_path(&mut props, "Connection")?;
        let possible_handlers = util::opt_string_list(&mut props, "PossibleHandlers")?;
        let interfaces = util::opt_string_list(&mut props, "Interfaces")?;

        let channels = if self.state_lock().channels_known {
            None
        } else {
            let details = util::take_channel_details(&mut props, "Channels")?;
            Some(build_channels(self.core.connection(), details)?)
        };

        helper.set_interfaces(interfaces.unwrap_or_default());
        let mut state = self.state_lock();
        state.account_path = Some(account);
        state.connection_path = Some(connection);
        state.possible_handlers = possible_handlers.unwrap_or_default();
        if let Some(channels) = channels {
            state.channels = channels;
            state.channels_known = true;
        }
        Ok(())
    }

    fn spawn_finished_watch(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let conn = inner.core.connection().clone();
        let bus_name = inner.core.bus_name().to_string();
        let path = inner.core.object_path().to_string();

        let task = inner.core.connection().executor().spawn(
            async move {
                let proxy = match zbus::Proxy::new(
                    &conn,
                    bus_name,
                    path,
                    TP_IFACE_CHANNEL_DISPATCH_OPERATION,
                )
                .await
                {
                    Ok(proxy) => proxy,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch Finished");
                        return;
                    }
                };
                let mut stream = match proxy.receive_signal("Finished").await {
                    Ok(stream) => stream,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch Finished");
                        return;
                    }
                };
                if stream.next().await.is_some() {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let message = "dispatch operation finished";
                    if inner
                        .core
                        .validity()
                        .invalidate(TP_ERROR_OBJECT_REMOVED, message)
                    {
                        inner.helper.notify_invalidated(TP_ERROR_OBJECT_REMOVED, message);
                    }
                }
            },
            "dispatch-finished-watch",
        );
        inner.tasks.insert("dispatch-finished-watch", task);
    }

    fn state_lock(&self) -> MutexGuard<'_, DispatchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

}

/// Channels of a dispatch operation live on the connection's bus name, which
/// each channel path implies.
fn build_channels(conn: &zbus::Connection, details: ChannelDetails) -> Result<Vec<Channel>> {
    let mut channels = Vec::with_capacity(details.len());
    for (path, props) in details {
        let service = bus::service_name_for_path(connection_prefix(path.as_str()));
        channels.push(Channel::with_properties(
            conn.clone(),
            service,
            path.as_str(),
            props,
        )?);
    }
    Ok(channels)
}

/// Channel paths extend their connection's path; the connection part is the
/// first seven elements (`/org/freedesktop/Telepathy/Connection/cm/proto/acct`).
fn connection_prefix(channel_path: &str) -> &str {
    let mut slashes = 0usize;
    for (index, byte) in channel_path.bytes().enumerate() {
        if byte == b'/' {
            slashes += 1;
            if slashes == 8 {
                return &channel_path[..index];
            }
        }
    }
    channel_path
}

/// Dispatcher calls qualify property names with the dispatch operation
/// interface; introspection code uses the bare names throughout.
fn normalize_immutable(props: PropertyMap) -> PropertyMap {
    let prefix = format!("{TP_IFACE_CHANNEL_DISPATCH_OPERATION}.");
    props
        .into_iter()
        .map(|(key, value)| {
            let name = match key.strip_prefix(&prefix) {
                Some(rest) if !rest.contains('.') => rest.to_string(),
                _ => key,
            };
            (name, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn extracts_the_connection_part_of_a_channel_path() {
        assert_eq!(
            connection_prefix(
                "/org/freedesktop/Telepathy/Connection/gabble/jabber/alice/TextChannel1"
            ),
            "/org/freedesktop/Telepathy/Connection/gabble/jabber/alice"
        );
        // A bare connection path maps to itself.
        assert_eq!(
            connection_prefix("/org/freedesktop/Telepathy/Connection/gabble/jabber/alice"),
            "/org/freedesktop/Telepathy/Connection/gabble/jabber/alice"
        );
    }

    #[test]
    fn strips_the_dispatch_interface_prefix() {
        let mut props = PropertyMap::new();
        props.insert(
            "org.freedesktop.Telepathy.ChannelDispatchOperation.Account".to_string(),
            zbus::zvariant::Value::from("x").try_to_owned().expect("owned"),
        );
        let normalized = normalize_immutable(props);
        assert!(normalized.contains_key("Account"));
    }
}
