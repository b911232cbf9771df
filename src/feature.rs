use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::readiness::ReadinessHelper;

/// An addressable unit of optional proxy functionality with a readiness
/// lifecycle.
///
/// Features are declared as constants by the proxy class that defines them,
/// namespaced by that class so `Connection` feature 0 and `Channel` feature 0
/// stay distinct. A *critical* feature must introspect successfully for any
/// [`PendingReady`](crate::PendingReady) requesting it to succeed; a
/// non-critical feature counts as resolved once it is known satisfied *or*
/// known missing.
#[derive(Clone, Copy, Debug)]
pub struct Feature {
    class: &'static str,
    id: u32,
    critical: bool,
}

impl Feature {
    /// A non-critical feature belonging to `class`.
    pub const fn new(class: &'static str, id: u32) -> Self {
        Self {
            class,
            id,
            critical: false,
        }
    }

    /// A critical feature belonging to `class`.
    pub const fn critical(class: &'static str, id: u32) -> Self {
        Self {
            class,
            id,
            critical: true,
        }
    }

    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }
}

// Identity is (class, id); the criticality flag is a property of the feature,
// not part of its name.
impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.id == other.id
    }
}

impl Eq for Feature {}

impl Hash for Feature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.id)
    }
}

/// A set of [`Feature`]s.
pub type Features = HashSet<Feature>;

/// Callback that starts the asynchronous introspection work for one feature.
///
/// The closure is handed a clone of the owning [`ReadinessHelper`]; it must
/// arrange for [`ReadinessHelper::set_introspect_completed`] to be called
/// exactly once for its feature, never synchronously from within the callback
/// itself.
pub type IntrospectFn = Arc<dyn Fn(ReadinessHelper) + Send + Sync>;

/// Static registration record binding a [`Feature`] to the statuses it
/// applies to, its dependencies, and its introspection callback.
#[derive(Clone)]
pub struct Introspectable {
    makes_sense_for_statuses: HashSet<u32>,
    depends_on_features: Features,
    depends_on_interfaces: Vec<String>,
    introspect: IntrospectFn,
    critical: bool,
}

impl Introspectable {
    pub fn new(
        makes_sense_for_statuses: impl IntoIterator<Item = u32>,
        depends_on_features: Features,
        depends_on_interfaces: impl IntoIterator<Item = impl Into<String>>,
        introspect: impl Fn(ReadinessHelper) + Send + Sync + 'static,
    ) -> Self {
        Self {
            makes_sense_for_statuses: makes_sense_for_statuses.into_iter().collect(),
            depends_on_features,
            depends_on_interfaces: depends_on_interfaces
                .into_iter()
                .map(Into::into)
                .collect(),
            introspect: Arc::new(introspect),
            critical: false,
        }
    }

    /// Mark this introspectable as critical. Used for core features, whose
    /// failure must fail every requesting operation.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub(crate) fn makes_sense_for_statuses(&self) -> &HashSet<u32> {
        &self.makes_sense_for_statuses
    }

    pub(crate) fn depends_on_features(&self) -> &Features {
        &self.depends_on_features
    }

    pub(crate) fn depends_on_interfaces(&self) -> &[String] {
        &self.depends_on_interfaces
    }

    pub(crate) fn introspect_fn(&self) -> IntrospectFn {
        self.introspect.clone()
    }
}

impl fmt::Debug for Introspectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Introspectable")
            .field("makes_sense_for_statuses", &self.makes_sense_for_statuses)
            .field("depends_on_features", &self.depends_on_features)
            .field("depends_on_interfaces", &self.depends_on_interfaces)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

/// Registry of introspectables, keyed uniquely by feature.
pub type Introspectables = HashMap<Feature, Introspectable>;

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn equality_ignores_criticality() {
        let plain = Feature::new("Channel", 3);
        let critical = Feature::critical("Channel", 3);
        assert_eq!(plain, critical);

        let mut set = Features::new();
        set.insert(plain);
        assert!(set.contains(&critical));
    }

    #[test]
    fn distinct_namespaces_do_not_collide() {
        let a = Feature::new("Channel", 0);
        let b = Feature::new("Connection", 0);
        assert_ne!(a, b);

        let set: Features = HashSet::from([a, b]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn display_names_class_and_id() {
        assert_eq!(Feature::new("Account", 1).to_string(), "Account/1");
    }
}
