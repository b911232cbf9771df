use crate::bus::{self, TP_IFACE_CHANNEL, TP_IFACE_CHANNEL_GROUP};
use crate::error::{Error, Result, TP_ERROR_OBJECT_REMOVED};
use crate::fake_handler::TrackedChannel;
use crate::feature::{Feature, Features, Introspectable, Introspectables};
use crate::pending::PendingReady;
use crate::proxy::ProxyCore;
use crate::readiness::ReadinessHelper;
use crate::tasks::TaskSet;
use crate::util::{self, PropertyMap};

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::StreamExt;

// Channels have no status ladder of their own; the scheduler runs under one
// synthetic status for the channel's whole life.
const CHANNEL_STATUS: u32 = 0;

/// Proxy for a communication channel object.
///
/// A channel's basic properties are immutable, so when the dispatcher hands
/// them over alongside the object path ([`Channel::with_properties`]) the
/// core feature becomes ready without any remote call. The remote `Closed`
/// signal invalidates the proxy.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    core: ProxyCore,
    helper: ReadinessHelper,
    state: Mutex<ChannelState>,
    tasks: TaskSet,
}

#[derive(Default)]
struct ChannelState {
    immutable: PropertyMap,
    channel_type: Option<String>,
    target_id: Option<String>,
    initiator_id: Option<String>,
    requested: Option<bool>,
    group_members: Option<Vec<u32>>,
}

impl Channel {
    /// Discovers the channel's type, target and interface list.
    pub const FEATURE_CORE: Feature = Feature::critical("Channel", 0);
    /// Group membership, for channels implementing the Group interface.
    pub const FEATURE_GROUP: Feature = Feature::new("Channel", 1);

    pub fn new(
        conn: zbus::Connection,
        bus_name: impl Into<String>,
        object_path: &str,
    ) -> Result<Self> {
        Self::with_properties(conn, bus_name, object_path, PropertyMap::new())
    }

    /// Construct a channel whose immutable properties are already known,
    /// as supplied in dispatcher calls.
    pub fn with_properties(
        conn: zbus::Connection,
        bus_name: impl Into<String>,
        object_path: &str,
        immutable: PropertyMap,
    ) -> Result<Self> {
        let core = ProxyCore::new(conn, bus_name, object_path)?;
        let helper = ReadinessHelper::new(core.validity(), CHANNEL_STATUS, Introspectables::new());
        let inner = Arc::new(ChannelInner {
            core,
            helper,
            state: Mutex::new(ChannelState {
                immutable: normalize_immutable(immutable),
                ..ChannelState::default()
            }),
            tasks: TaskSet::new(),
        });

        inner.helper.add_introspectables(Self::introspectables(&inner));
        ChannelInner::spawn_closed_watch(&inner);
        let _core = inner.helper.become_ready(HashSet::from([Self::FEATURE_CORE]));
        Ok(Self { inner })
    }

    fn introspectables(inner: &Arc<ChannelInner>) -> Introspectables {
        let mut introspectables = Introspectables::new();

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_CORE,
            Introspectable::new(
                [CHANNEL_STATUS],
                Features::new(),
                Vec::<String>::new(),
                move |helper| {
                    ChannelInner::dispatch(&weak, "channel-core-introspect", move |inner| async move {
                        let result = inner.introspect_core(&helper).await;
                        helper.set_introspect_completed(&Channel::FEATURE_CORE, result);
                    });
                },
            )
            .critical(),
        );

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_GROUP,
            Introspectable::new(
                [CHANNEL_STATUS],
                HashSet::from([Self::FEATURE_CORE]),
                [TP_IFACE_CHANNEL_GROUP],
                move |helper| {
                    ChannelInner::dispatch(&weak, "channel-group-introspect", move |inner| async move {
                        let result = inner.introspect_group().await;
                        helper.set_introspect_completed(&Channel::FEATURE_GROUP, result);
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

    /// The channel type interface name, known once the core feature is
    /// ready.
    pub fn channel_type(&self) -> Option<String> {
        self.inner.state_lock().channel_type.clone()
    }

    /// The identifier of the remote party, if the channel has one.
    pub fn target_id(&self) -> Option<String> {
        self.inner.state_lock().target_id.clone()
    }

    /// The identifier of the contact that initiated the channel, when known.
    pub fn initiator_id(&self) -> Option<String> {
        self.inner.state_lock().initiator_id.clone()
    }

    /// Whether the local user requested this channel, when known.
    pub fn is_requested(&self) -> Option<bool> {
        self.inner.state_lock().requested
    }

    /// Handles of the group members, known once [`Self::FEATURE_GROUP`] is
    /// ready.
    pub fn group_members(&self) -> Option<Vec<u32>> {
        self.inner.state_lock().group_members.clone()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.inner.helper.interfaces()
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

    /// Ask the service to close the channel. Failures racing the channel's
    /// own closure count as success.
    pub async fn request_close(&self) -> Result<()> {
        if !self.inner.core.is_valid() {
            return Ok(());
        }
        let proxy = self.inner.core.interface_proxy(TP_IFACE_CHANNEL).await?;
        match proxy.call::<_, _, ()>("Close", &()).await {
            Ok(()) => Ok(()),
            Err(_) if !self.inner.core.is_valid() => Ok(()),
            Err(err) => Err(bus::map_zbus_error(err)),
        }
    }

    pub(crate) fn tracked(&self) -> TrackedChannel {
        TrackedChannel::new(
            self.inner.core.path().clone(),
            Arc::downgrade(&self.inner.core.validity()),
        )
    }
}

impl ChannelInner {
    fn dispatch<F, Fut>(weak: &Weak<Self>, name: &str, work: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let fut = work(inner.clone());
        let task = inner.core.connection().executor().spawn(fut, name);
        inner.tasks.insert(name, task);
    }

    async fn introspect_core(&self, helper: &ReadinessHelper) -> Result<()> {
        let cached = {
            let mut state = self.state_lock();
            if state.immutable.contains_key("ChannelType")
                && state.immutable.contains_key("Interfaces")
            {
                Some(std::mem::take(&mut state.immutable))
            } else {
                None
            }
        };
        let mut props = match cached {
            Some(props) => props,
            None => self.core.get_all(TP_IFACE_CHANNEL).await?,
        };

        let channel_type = util::take_string(&mut props, "ChannelType")?;
        let interfaces = util::take_string_list(&mut props, "Interfaces")?;
        let target_id = util::opt_string(&mut props, "TargetID")?;
        let initiator_id = util::opt_string(&mut props, "InitiatorID")?;
        let requested = util::opt_bool(&mut props, "Requested")?;

        helper.set_interfaces(interfaces);
        let mut state = self.state_lock();
        state.channel_type = Some(channel_type);
        state.target_id = target_id;
        state.initiator_id = initiator_id;
        state.requested = requested;
        Ok(())
    }

    async fn introspect_group(&self) -> Result<()> {
        let value = self
            .core
            .get_property(TP_IFACE_CHANNEL_GROUP, "Members")
            .await?;
        let members = Vec::<u32>::try_from(value)
            .map_err(|e| Error::parse_error(format!("Members has unexpected type: {e}")))?;
        self.state_lock().group_members = Some(members);
        Ok(())
    }

    fn spawn_closed_watch(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let conn = inner.core.connection().clone();
        let bus_name = inner.core.bus_name().to_string();
        let path = inner.core.object_path().to_string();

        let task = inner.core.connection().executor().spawn(
            async move {
                let proxy = match zbus::Proxy::new(&conn, bus_name, path, TP_IFACE_CHANNEL).await {
                    Ok(proxy) => proxy,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch Closed");
                        return;
                    }
                };
                let mut stream = match proxy.receive_signal("Closed").await {
                    Ok(stream) => stream,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch Closed");
                        return;
                    }
                };
                if stream.next().await.is_some() {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.handle_closed();
                }
            },
            "channel-closed-watch",
        );
        inner.tasks.insert("channel-closed-watch", task);
    }

    fn handle_closed(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(path = self.core.object_path(), "channel closed by the service");
        if self
            .core
            .validity()
            .invalidate(TP_ERROR_OBJECT_REMOVED, "channel closed")
        {
            self.helper
                .notify_invalidated(TP_ERROR_OBJECT_REMOVED, "channel closed");
        }
    }

    fn state_lock(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

}

/// Dispatcher calls qualify immutable property names with the channel
/// interface; introspection code uses the bare names throughout.
fn normalize_immutable(props: PropertyMap) -> PropertyMap {
    let prefix = format!("{TP_IFACE_CHANNEL}.");
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
