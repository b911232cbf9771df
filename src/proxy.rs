use crate::bus::{self, DBUS_PROPERTIES_INTERFACE};
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};

/// Shared validity record of an owning object.
///
/// This is the contract the readiness engine consumes: a check for whether
/// the object is still usable, and the recorded (error name, message) pair
/// once it is not. The first invalidation wins; later ones are ignored.
#[derive(Debug, Default)]
pub struct Validity {
    invalidation: Mutex<Option<(String, String)>>,
}

impl Validity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_valid(&self) -> bool {
        self.lock().is_none()
    }

    /// Record the invalidation pair. Returns `false` when the object was
    /// already invalid (the original record is kept).
    pub fn invalidate(&self, name: impl Into<String>, message: impl Into<String>) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some((name.into(), message.into()));
        true
    }

    /// The recorded (error name, error message) pair, if invalidated.
    pub fn invalidation(&self) -> Option<(String, String)> {
        self.lock().clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.lock()
            .as_ref()
            .map(|(name, message)| Error::Invalidated {
                name: name.clone(),
                message: message.clone(),
            })
    }

    fn lock(&self) -> MutexGuard<'_, Option<(String, String)>> {
        match self.invalidation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-proxy D-Bus plumbing shared by every proxy class: the bus connection,
/// the remote object's address, and the validity record.
#[derive(Clone, Debug)]
pub struct ProxyCore {
    conn: zbus::Connection,
    service: String,
    path: OwnedObjectPath,
    validity: Arc<Validity>,
}

impl ProxyCore {
    pub fn new(conn: zbus::Connection, service: impl Into<String>, path: &str) -> Result<Self> {
        let path = ObjectPath::try_from(path)
            .map_err(|e| Error::invalid_argument(format!("invalid object path: {e}")))?
            .into();
        Ok(Self {
            conn,
            service: service.into(),
            path,
            validity: Validity::new(),
        })
    }

    pub fn connection(&self) -> &zbus::Connection {
        &self.conn
    }

    pub fn bus_name(&self) -> &str {
        &self.service
    }

    pub fn object_path(&self) -> &str {
        self.path.as_str()
    }

    pub fn is_valid(&self) -> bool {
        self.validity.is_valid()
    }

    /// The recorded invalidation pair, once the proxy is invalid.
    pub fn invalidation(&self) -> Option<(String, String)> {
        self.validity.invalidation()
    }

    pub(crate) fn validity(&self) -> Arc<Validity> {
        self.validity.clone()
    }

    pub(crate) fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    pub(crate) async fn interface_proxy(&self, interface: &'static str) -> Result<zbus::Proxy<'_>> {
        zbus::Proxy::new(&self.conn, self.service.as_str(), self.path.as_str(), interface)
            .await
            .map_err(bus::map_zbus_error)
    }

    /// Bulk property fetch, the building block of every core-feature
    /// introspection.
    pub(crate) async fn get_all(&self, interface: &str) -> Result<HashMap<String, OwnedValue>> {
        let proxy = self.interface_proxy(DBUS_PROPERTIES_INTERFACE).await?;
        proxy
            .call("GetAll", &(interface))
            .await
            .map_err(bus::map_zbus_error)
    }

    /// Single property fetch, for optional features that only need one value.
    pub(crate) async fn get_property(&self, interface: &str, name: &str) -> Result<OwnedValue> {
        let proxy = self.interface_proxy(DBUS_PROPERTIES_INTERFACE).await?;
        proxy
            .call("Get", &(interface, name))
            .await
            .map_err(bus::map_zbus_error)
    }
}
