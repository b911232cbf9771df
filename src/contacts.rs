use crate::bus::{TP_IFACE_CONNECTION_CONTACT_GROUPS, TP_IFACE_CONNECTION_CONTACT_LIST};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{Error, Result};
use crate::feature::{Feature, Features, Introspectable, Introspectables};
use crate::pending::PendingReady;
use crate::proxy::ProxyCore;
use crate::readiness::ReadinessHelper;
use crate::tasks::TaskSet;

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Contact roster access for one connection.
///
/// Shares the owning [`Connection`]'s D-Bus plumbing and validity record but
/// runs its own readiness scheduler: roster features only make sense once the
/// connection is connected, and the connection feeds its status transitions
/// through so a reconnect re-runs roster introspection.
#[derive(Clone)]
pub struct ContactManager {
    inner: Arc<ContactManagerInner>,
}

struct ContactManagerInner {
    core: ProxyCore,
    helper: ReadinessHelper,
    state: Mutex<RosterState>,
    tasks: TaskSet,
}

#[derive(Default)]
struct RosterState {
    can_change_contact_list: Option<bool>,
    groups: Option<Vec<String>>,
}

impl ContactManager {
    /// Discovers the contact list's capabilities.
    pub const FEATURE_CORE: Feature = Feature::critical("ContactManager", 0);
    /// The names of user-defined contact groups.
    pub const FEATURE_GROUPS: Feature = Feature::new("ContactManager", 1);

    pub(crate) fn new(core: ProxyCore) -> Self {
        let helper = ReadinessHelper::new(
            core.validity(),
            Connection::STATUS_UNKNOWN,
            Introspectables::new(),
        );
        let inner = Arc::new(ContactManagerInner {
            core,
            helper,
            state: Mutex::new(RosterState::default()),
            tasks: TaskSet::new(),
        });
        inner.helper.add_introspectables(Self::introspectables(&inner));
        Self { inner }
    }

    fn introspectables(inner: &Arc<ContactManagerInner>) -> Introspectables {
        let connected = [ConnectionStatus::Connected.as_u32()];
        let mut introspectables = Introspectables::new();

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_CORE,
            Introspectable::new(
                connected,
                Features::new(),
                [TP_IFACE_CONNECTION_CONTACT_LIST],
                move |helper| {
                    ContactManagerInner::dispatch(&weak, "roster-core-introspect", move |inner| async move {
                        let result = inner.introspect_core().await;
                        helper.set_introspect_completed(&ContactManager::FEATURE_CORE, result);
                    });
                },
            )
            .critical(),
        );

        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_GROUPS,
            Introspectable::new(
                connected,
                HashSet::from([Self::FEATURE_CORE]),
                [TP_IFACE_CONNECTION_CONTACT_GROUPS],
                move |helper| {
                    ContactManagerInner::dispatch(&weak, "roster-groups-introspect", move |inner| async move {
                        let result = inner.introspect_groups().await;
                        helper.set_introspect_completed(&ContactManager::FEATURE_GROUPS, result);
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

    /// Whether the protocol allows modifying the contact list, known once
    /// [`Self::FEATURE_CORE`] is ready.
    pub fn can_change_contact_list(&self) -> Option<bool> {
        self.inner.state_lock().can_change_contact_list
    }

    /// User-defined group names, known once [`Self::FEATURE_GROUPS`] is
    /// ready.
    pub fn groups(&self) -> Option<Vec<String>> {
        self.inner.state_lock().groups.clone()
    }

    // The owning connection drives the scheduler below: the roster never
    // watches the bus itself.

    pub(crate) fn link_interfaces(&self, interfaces: Vec<String>) {
        self.inner.helper.set_interfaces(interfaces);
    }

    pub(crate) fn force_status(&self, status: u32) {
        self.inner.helper.force_current_status(status);
    }

    pub(crate) fn set_status(&self, status: u32) {
        self.inner.helper.set_current_status(status);
    }

    pub(crate) fn notify_invalidated(&self, name: &str, message: &str) {
        self.inner.helper.notify_invalidated(name, message);
    }
}

impl ContactManagerInner {
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

    async fn introspect_core(&self) -> Result<()> {
        let mut props = self.core.get_all(TP_IFACE_CONNECTION_CONTACT_LIST).await?;
        let can_change = crate::util::opt_bool(&mut props, "CanChangeContactList")?;
        self.state_lock().can_change_contact_list = Some(can_change.unwrap_or(false));
        Ok(())
    }

    async fn introspect_groups(&self) -> Result<()> {
        let value = self
            .core
            .get_property(TP_IFACE_CONNECTION_CONTACT_GROUPS, "Groups")
            .await?;
        let groups = Vec::<String>::try_from(value)
            .map_err(|e| Error::parse_error(format!("Groups has unexpected type: {e}")))?;
        self.state_lock().groups = Some(groups);
        Ok(())
    }

    fn state_lock(&self) -> MutexGuard<'_, RosterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
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
    fn roster_features_do_not_collide_with_connection_features() {
        assert_ne!(ContactManager::FEATURE_CORE, Connection::FEATURE_CORE);
        let features: Features = HashSet::from([
            ContactManager::FEATURE_CORE,
            ContactManager::FEATURE_GROUPS,
            Connection::FEATURE_CORE,
        ]);
        assert_eq!(features.len(), 3);
    }
}
