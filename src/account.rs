use crate::bus::{TP_ACCOUNT_MANAGER_DESTINATION, TP_IFACE_ACCOUNT};
use crate::error::{Error, Result, TP_ERROR_OBJECT_REMOVED};
use crate::feature::{Feature, Features, Introspectable, Introspectables};
use crate::pending::PendingReady;
use crate::proxy::ProxyCore;
use crate::readiness::ReadinessHelper;
use crate::tasks::TaskSet;
use crate::util;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use zbus::zvariant::OwnedObjectPath;

const ACCOUNT_STATUS: u32 = 0;

/// Proxy for an account object of the account manager service.
///
/// Accounts always live on the account manager's well-known bus name, so
/// construction only takes the object path. The remote `Removed` signal
/// invalidates the proxy.
#[derive(Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

struct AccountInner {
    core: ProxyCore,
    helper: ReadinessHelper,
    state: Mutex<AccountState>,
    tasks: TaskSet,
}

#[derive(Default)]
struct AccountState {
    display_name: Option<String>,
    usable: Option<bool>,
    connection_path: Option<OwnedObjectPath>,
}

impl Account {
    /// Discovers the account's basic properties.
    pub const FEATURE_CORE: Feature = Feature::critical("Account", 0);

    pub fn new(conn: zbus::Connection, object_path: &str) -> Result<Self> {
        let core = ProxyCore::new(conn, TP_ACCOUNT_MANAGER_DESTINATION, object_path)?;
        let helper = ReadinessHelper::new(core.validity(), ACCOUNT_STATUS, Introspectables::new());
        let inner = Arc::new(AccountInner {
            core,
            helper,
            state: Mutex::new(AccountState::default()),
            tasks: TaskSet::new(),
        });

        inner.helper.add_introspectables(Self::introspectables(&inner));
        AccountInner::spawn_removed_watch(&inner);
        let _core = inner.helper.become_ready(HashSet::from([Self::FEATURE_CORE]));
        Ok(Self { inner })
    }

    fn introspectables(inner: &Arc<AccountInner>) -> Introspectables {
        let mut introspectables = Introspectables::new();
        let weak = Arc::downgrade(inner);
        introspectables.insert(
            Self::FEATURE_CORE,
            Introspectable::new(
                [ACCOUNT_STATUS],
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
                            helper.set_introspect_completed(&Account::FEATURE_CORE, result);
                        }
                    };
                    let task = inner
                        .core
                        .connection()
                        .executor()
                        .spawn(fut, "account-core-introspect");
                    inner.tasks.insert("account-core-introspect", task);
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

    /// The human-readable account name, known once the core feature is
    /// ready.
    pub fn display_name(&self) -> Option<String> {
        self.inner.state_lock().display_name.clone()
    }

    /// Whether the account's settings are complete enough to bring it
    /// online.
    pub fn is_usable(&self) -> Option<bool> {
        self.inner.state_lock().usable
    }

    /// The path of the account's active connection object, if it has one.
    pub fn connection_path(&self) -> Option<OwnedObjectPath> {
        self.inner.state_lock().connection_path.clone()
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

    pub fn object_path(&self) -> &str {
        self.inner.core.object_path()
    }
}

impl AccountInner {
    async fn introspect_core(&self, helper: &ReadinessHelper) -> Result<()> {
        let mut props = self.core.get_all(TP_IFACE_ACCOUNT).await?;
        let display_name = util::take_string(&mut props, "DisplayName")?;
        let usable = util::take_bool(&mut props, "Valid")?;
        let connection = util::take_path(&mut props, "Connection")?;
        let interfaces = util::opt_string_list(&mut props, "Interfaces")?;

        helper.set_interfaces(interfaces.unwrap_or_default());
        let mut state = self.state_lock();
        state.display_name = Some(display_name);
        state.usable = Some(usable);
        // "/" is the wire encoding for "no connection".
        state.connection_path = (connection.as_str() != "/").then_some(connection);
        Ok(())
    }

    fn spawn_removed_watch(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let conn = inner.core.connection().clone();
        let path = inner.core.object_path().to_string();

        let task = inner.core.connection().executor().spawn(
            async move {
                let proxy = match zbus::Proxy::new(
                    &conn,
                    TP_ACCOUNT_MANAGER_DESTINATION,
                    path,
                    TP_IFACE_ACCOUNT,
                )
                .await
                {
                    Ok(proxy) => proxy,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch Removed");
                        return;
                    }
                };
                let mut stream = match proxy.receive_signal("Removed").await {
                    Ok(stream) => stream,
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %_err, "failed to watch Removed");
                        return;
                    }
                };
                if stream.next().await.is_some() {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    if inner
                        .core
                        .validity()
                        .invalidate(TP_ERROR_OBJECT_REMOVED, "account removed")
                    {
                        inner
                            .helper
                            .notify_invalidated(TP_ERROR_OBJECT_REMOVED, "account removed");
                    }
                }
            },
            "account-removed-watch",
        );
        inner.tasks.insert("account-removed-watch", task);
    }

    fn state_lock(&self) -> MutexGuard<'_, AccountState> {
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
    fn account_core_is_critical_and_namespaced() {
        assert!(Account::FEATURE_CORE.is_critical());
        assert_ne!(Account::FEATURE_CORE, crate::Connection::FEATURE_CORE);
    }
}
