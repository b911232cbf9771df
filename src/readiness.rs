use crate::error::{Error, Result};
use crate::feature::{Feature, Features, IntrospectFn, Introspectables};
use crate::pending::{OperationShared, PendingReady};
use crate::proxy::Validity;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Scheduler driving the staged introspection of one proxy's features.
///
/// The helper owns the registry of [`Introspectable`](crate::Introspectable)s
/// and resolves, for every concurrent [`become_ready`](Self::become_ready)
/// caller, whether each requested feature becomes satisfied or permanently
/// missing. Independent features are dispatched in the same scheduling pass
/// so their remote calls run concurrently; declared feature and interface
/// dependencies are honored causally; status transitions of the owning proxy
/// reset the epoch, deferred until in-flight introspection drains.
///
/// Handles are cheap to clone and share one scheduler. All state transitions
/// are serialized behind a single lock; introspect callbacks, operation
/// resolutions and status-ready notifications always run with that lock
/// released, via an internal wake queue drained run-to-completion. Introspect
/// callbacks must report back through
/// [`set_introspect_completed`](Self::set_introspect_completed) from an async
/// task, never synchronously from within the callback invocation.
#[derive(Clone)]
pub struct ReadinessHelper {
    shared: Arc<Shared>,
}

struct Shared {
    validity: Arc<Validity>,
    state: Mutex<State>,
}

struct State {
    current_status: u32,
    interfaces: Vec<String>,
    introspectables: Introspectables,
    supported_statuses: HashSet<u32>,
    supported_features: Features,
    satisfied: Features,
    requested: Features,
    missing: Features,
    pending: Features,
    in_flight: Features,
    missing_errors: HashMap<Feature, Error>,
    operations: Vec<Operation>,
    invalidation: Option<(String, String)>,
    pending_status: Option<u32>,
    status_watchers: Vec<StatusCallback>,
    wake_queued: bool,
    draining: bool,
}

struct Operation {
    requested: Features,
    shared: Arc<OperationShared>,
}

type StatusCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Work collected under the lock, performed after it is released.
#[derive(Default)]
struct Effects {
    dispatch: Vec<IntrospectFn>,
    resolve: Vec<(Arc<OperationShared>, Result<()>)>,
    status_ready: Vec<(StatusCallback, u32)>,
}

impl Effects {
    fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.resolve.is_empty() && self.status_ready.is_empty()
    }

    fn run(self, helper: &ReadinessHelper) {
        for (op, result) in self.resolve {
            op.finish(result);
        }
        for introspect in self.dispatch {
            introspect(helper.clone());
        }
        for (watcher, status) in self.status_ready {
            watcher(status);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // No operation is ever silently dropped: anything still outstanding
        // when the last handle goes away resolves as cancelled.
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for op in state.operations.drain(..) {
            op.shared
                .finish(Err(Error::cancelled("readiness helper destroyed")));
        }
    }
}

impl ReadinessHelper {
    /// Create a helper for an owning object in `initial_status`, with an
    /// initial introspectable registry (possibly empty; proxies typically
    /// register via [`add_introspectables`](Self::add_introspectables) once
    /// their callbacks can be constructed).
    pub fn new(
        validity: Arc<Validity>,
        initial_status: u32,
        introspectables: Introspectables,
    ) -> Self {
        let mut supported_statuses = HashSet::new();
        let mut supported_features = Features::new();
        for (feature, introspectable) in &introspectables {
            supported_statuses.extend(introspectable.makes_sense_for_statuses().iter().copied());
            supported_features.insert(*feature);
        }

        Self {
            shared: Arc::new(Shared {
                validity,
                state: Mutex::new(State {
                    current_status: initial_status,
                    interfaces: Vec::new(),
                    introspectables,
                    supported_statuses,
                    supported_features,
                    satisfied: Features::new(),
                    requested: Features::new(),
                    missing: Features::new(),
                    pending: Features::new(),
                    in_flight: Features::new(),
                    missing_errors: HashMap::new(),
                    operations: Vec::new(),
                    invalidation: None,
                    pending_status: None,
                    status_watchers: Vec::new(),
                    wake_queued: false,
                    draining: false,
                }),
            }),
        }
    }

    /// Register more introspectables. Duplicate feature keys are skipped with
    /// a warning; the existing entry wins. Subclass hierarchies register
    /// overlapping features, so this is tolerant rather than fatal.
    pub fn add_introspectables(&self, introspectables: Introspectables) {
        let mut state = self.lock();
        for (feature, introspectable) in introspectables {
            if state.introspectables.contains_key(&feature) {
                #[cfg(feature = "tracing")]
                tracing::warn!(%feature, "introspectable for this feature already exists, skipping");
                continue;
            }
            state
                .supported_statuses
                .extend(introspectable.makes_sense_for_statuses().iter().copied());
            state.supported_features.insert(feature);
            state.introspectables.insert(feature, introspectable);
        }
    }

    pub fn current_status(&self) -> u32 {
        self.lock().current_status
    }

    /// Force the internal status without resetting accumulated epoch state.
    /// Used when the status is unknown at construction and discovered by the
    /// first introspection run itself; requests parked while the status was
    /// still unknown are re-examined under the discovered status.
    pub fn force_current_status(&self, status: u32) {
        {
            let mut state = self.lock();
            if state.current_status == status {
                return;
            }
            state.current_status = status;
            state.wake_queued = true;
        }
        self.drain();
    }

    /// Interface names known to be supported by the remote object. Core
    /// features publish the discovered list here before completing, so that
    /// later features' interface dependencies see it.
    pub fn set_interfaces(&self, interfaces: Vec<String>) {
        self.lock().interfaces = interfaces;
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.lock().interfaces.clone()
    }

    /// Union of all features ever requested for the current status epoch.
    pub fn requested_features(&self) -> Features {
        self.lock().requested.clone()
    }

    /// Features whose introspection succeeded.
    pub fn actual_features(&self) -> Features {
        self.lock().satisfied.clone()
    }

    /// Features known to be unavailable (failed introspection, failed
    /// dependency, or missing interface).
    pub fn missing_features(&self) -> Features {
        self.lock().missing.clone()
    }

    /// The recorded error for a missing feature, if any.
    pub fn missing_feature_error(&self, feature: &Feature) -> Option<Error> {
        self.lock().missing_errors.get(feature).cloned()
    }

    /// Subscribe to "status fully settled" notifications, emitted whenever
    /// every requested feature of the current epoch has resolved one way or
    /// the other (or immediately, for statuses no feature applies to).
    pub fn on_status_ready(&self, watcher: impl Fn(u32) + Send + Sync + 'static) {
        self.lock().status_watchers.push(Arc::new(watcher));
    }

    /// Synchronous readiness poll for a feature set.
    ///
    /// A critical feature is ready only when satisfied; a non-critical
    /// feature counts as ready once resolved either way, so callers must
    /// check [`missing_features`](Self::missing_features) to learn whether
    /// the functionality is actually there.
    pub fn check_ready(&self, features: &Features) -> Result<()> {
        if let Some(err) = self.shared.validity.error() {
            return Err(err);
        }
        let state = self.lock();
        if let Some(err) = state.invalidation_error() {
            return Err(err);
        }
        state.check_ready(features)
    }

    pub fn is_ready(&self, features: &Features) -> bool {
        self.check_ready(features).is_ok()
    }

    /// Request that `features` become ready, returning a future that
    /// resolves once every one of them is satisfied or known missing.
    ///
    /// Calls with a feature set equal to one of an operation still
    /// outstanding return a handle to that same operation.
    pub fn become_ready(&self, features: Features) -> PendingReady {
        if features.is_empty() {
            return PendingReady::finished(features, Ok(()));
        }

        let mut state = self.lock();
        // Checked under the state lock: notify_invalidated drains the
        // operation list under the same lock, so an invalidation either
        // fails this call right here or catches the operation it registers.
        if let Some(err) = state.invalidation_error().or_else(|| self.shared.validity.error()) {
            return PendingReady::finished(features, Err(err));
        }
        if !features.is_subset(&state.supported_features) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                requested = ?features,
                supported = ?state.supported_features,
                "become_ready called with unsupported features"
            );
            return PendingReady::finished(
                features,
                Err(Error::invalid_argument(
                    "requested features contain an unsupported feature",
                )),
            );
        }

        for op in &state.operations {
            if op.requested == features {
                return PendingReady::new(features, op.shared.clone());
            }
        }

        // Fold the recursive dependencies in now, so a status change can
        // re-derive pending work from `requested` alone.
        let mut with_deps = features.clone();
        for feature in &features {
            with_deps.extend(state.deps_for(feature));
        }
        state.requested.extend(with_deps.iter().copied());
        state.pending.extend(with_deps.iter().copied());

        let shared = OperationShared::new();
        state.operations.push(Operation {
            requested: features.clone(),
            shared: shared.clone(),
        });
        state.wake_queued = true;

        drop(state);
        self.drain();
        PendingReady::new(features, shared)
    }

    /// Report the outcome of one feature's introspection. Invoked by the
    /// proxy's introspect callback when its remote call(s) finish, always
    /// from a separate async task.
    pub fn set_introspect_completed(&self, feature: &Feature, result: Result<()>) {
        if !self.shared.validity.is_valid() {
            // Proxy became invalid; outstanding operations were already
            // aborted and the old epoch's bookkeeping no longer matters.
            return;
        }

        let effects = {
            let mut state = self.lock();
            if state.invalidation.is_some() {
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(%feature, success = result.is_ok(), "introspect completed");

            if state.pending_status.is_some() {
                // A status change arrived while this feature was in flight:
                // the completion belongs to the old epoch, so only the
                // in-flight window shrinks. Once it empties, the deferred
                // status change applies.
                state.in_flight.remove(feature);
                if !state.in_flight.is_empty() {
                    return;
                }
                let Some(target) = state.pending_status.take() else {
                    return;
                };
                state.apply_status(target)
            } else {
                if !state.pending.contains(feature) || !state.in_flight.contains(feature) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        %feature,
                        "set_introspect_completed for a feature that is not in flight; \
                         proxy implementation bug, ignoring"
                    );
                    return;
                }

                match result {
                    Ok(()) => {
                        state.satisfied.insert(*feature);
                    }
                    Err(err) => {
                        if err.dbus_name().is_empty() {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                %feature,
                                "introspection failed but no error name was given"
                            );
                        }
                        state.missing.insert(*feature);
                        state.missing_errors.insert(*feature, err);
                    }
                }

                state.pending.remove(feature);
                state.in_flight.remove(feature);
                state.wake_queued = true;
                Effects::default()
            }
        };

        effects.run(self);
        self.drain();
    }

    /// Record a status transition of the owning object.
    ///
    /// With nothing in flight the transition applies immediately: the
    /// satisfied/missing sets (and their error records) reset and every
    /// feature requested so far becomes pending again under the new status.
    /// With introspection in flight the transition is deferred until the last
    /// in-flight feature reports completion, so no state derived from the new
    /// status is observable before the old epoch has drained.
    pub fn set_current_status(&self, status: u32) {
        let effects = {
            let mut state = self.lock();
            if state.current_status == status {
                return;
            }
            if state.in_flight.is_empty() {
                state.apply_status(status)
            } else {
                #[cfg(feature = "tracing")]
                tracing::debug!(status, "status changed while introspection was running, deferring");
                state.pending_status = Some(status);
                return;
            }
        };

        effects.run(self);
        self.drain();
    }

    /// The owning object was invalidated: fail every outstanding operation
    /// with the invalidation pair and stop all further scheduling. Callers
    /// mark the shared [`Validity`] record first; the pair is recorded in the
    /// scheduler state as well, so requests racing this notification on the
    /// separate validity lock still observe it.
    pub fn notify_invalidated(&self, name: &str, message: &str) {
        let operations = {
            let mut state = self.lock();
            state.invalidation = Some((name.to_string(), message.to_string()));
            state.satisfied.clear();
            state.missing.clear();
            std::mem::take(&mut state.operations)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(name, message, outstanding = operations.len(), "proxy invalidated");

        for op in operations {
            op.shared.finish(Err(Error::Invalidated {
                name: name.to_string(),
                message: message.to_string(),
            }));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run scheduling iterations until the wake queue is empty. Only one
    /// drainer runs at a time; anything that queues a wake while a drain is
    /// active is picked up by the active drainer, which is what lets the
    /// current call stack unwind before the state machine continues.
    fn drain(&self) {
        {
            let mut state = self.lock();
            if state.draining || !state.wake_queued {
                return;
            }
            state.draining = true;
        }

        loop {
            let effects = {
                let mut state = self.lock();
                if !state.wake_queued {
                    state.draining = false;
                    return;
                }
                state.wake_queued = false;
                self.iterate(&mut state)
            };
            if !effects.is_empty() {
                effects.run(self);
            }
        }
    }

    /// One scheduling pass; the core of the engine.
    fn iterate(&self, state: &mut State) -> Effects {
        let mut effects = Effects::default();

        if state.invalidation.is_some() || !self.shared.validity.is_valid() {
            return effects;
        }
        if !state.supported_statuses.contains(&state.current_status) {
            return effects;
        }
        // While a status change is pending nothing may resolve, settle, or
        // dispatch: completions for the old epoch only drain the in-flight
        // window (see set_introspect_completed).
        if state.pending_status.is_some() {
            return effects;
        }

        // Flag pending reverse-dependencies of already-missing features as
        // missing themselves. A single pass per iteration suffices:
        // deps_for() is the recursive closure, and each completion triggers
        // another iteration anyway.
        let newly_missing: Vec<Feature> = state
            .pending
            .iter()
            .filter(|feature| !state.deps_for(feature).is_disjoint(&state.missing))
            .copied()
            .collect();
        for feature in newly_missing {
            state.missing.insert(feature);
            state.missing_errors.insert(
                feature,
                Error::not_available("feature depends on other features that are not available"),
            );
        }

        let completed: Features = state.satisfied.union(&state.missing).copied().collect();

        // Resolve every operation whose requested set is fully covered.
        let operations = std::mem::take(&mut state.operations);
        let mut remaining = Vec::with_capacity(operations.len());
        for op in operations {
            if op.requested.is_subset(&completed) {
                effects
                    .resolve
                    .push((op.shared, state.check_ready(&op.requested)));
            } else {
                remaining.push(op);
            }
        }
        state.operations = remaining;

        // Everything requested so far has resolved: the status is settled
        // and there is nothing left to dispatch this epoch.
        if state.requested.is_subset(&completed) {
            let status = state.current_status;
            for watcher in &state.status_watchers {
                effects.status_ready.push((watcher.clone(), status));
            }
            return effects;
        }

        // Re-derive the pending set: close over feature dependencies, then
        // drop whatever has already resolved.
        let mut expanded = state.pending.clone();
        for feature in &state.pending {
            expanded.extend(state.deps_for(feature));
        }
        state.pending = expanded.difference(&completed).copied().collect();

        // Features whose feature-dependencies are all satisfied are ready to
        // introspect. Features depending on a missing feature were force-
        // marked missing above, so they are no longer pending at all.
        let ready_to_introspect: Vec<Feature> = state
            .pending
            .iter()
            .filter(|feature| {
                state
                    .introspectables
                    .get(feature)
                    .is_some_and(|i| i.depends_on_features().is_subset(&state.satisfied))
            })
            .copied()
            .collect();

        for feature in ready_to_introspect {
            if state.in_flight.contains(&feature) {
                continue;
            }
            let Some(introspectable) = state.introspectables.get(&feature) else {
                continue;
            };

            if !introspectable
                .makes_sense_for_statuses()
                .contains(&state.current_status)
            {
                // Vacuously satisfied: nothing to do for this feature in the
                // current status. Restart the pass rather than keep mutating
                // the set being walked.
                state.satisfied.insert(feature);
                state.pending.remove(&feature);
                state.wake_queued = true;
                return effects;
            }

            if let Some(absent) = introspectable
                .depends_on_interfaces()
                .iter()
                .find(|name| !state.interfaces.contains(name))
            {
                #[cfg(feature = "tracing")]
                tracing::debug!(%feature, interface = %absent, "interface dependency not present");
                #[cfg(not(feature = "tracing"))]
                let _ = absent;
                state.missing.insert(feature);
                state.missing_errors.insert(
                    feature,
                    Error::not_available("feature depends on interfaces that are not available"),
                );
                state.pending.remove(&feature);
                state.wake_queued = true;
                return effects;
            }

            // Dispatching every ready feature in the same pass is deliberate:
            // independent remote calls run concurrently instead of serially.
            state.in_flight.insert(feature);
            effects.dispatch.push(introspectable.introspect_fn());
        }

        effects
    }
}

impl State {
    fn invalidation_error(&self) -> Option<Error> {
        self.invalidation
            .as_ref()
            .map(|(name, message)| Error::Invalidated {
                name: name.clone(),
                message: message.clone(),
            })
    }

    /// Recursive feature-dependency closure. Dependencies on unregistered
    /// features contribute nothing; cycles terminate.
    fn deps_for(&self, feature: &Feature) -> Features {
        let mut deps = Features::new();
        let mut stack = vec![*feature];
        while let Some(current) = stack.pop() {
            let Some(introspectable) = self.introspectables.get(&current) else {
                continue;
            };
            for dep in introspectable.depends_on_features() {
                if deps.insert(*dep) {
                    stack.push(*dep);
                }
            }
        }
        deps
    }

    fn check_ready(&self, features: &Features) -> Result<()> {
        for feature in features {
            if !self.supported_features.contains(feature) {
                return Err(Error::invalid_argument("unsupported feature"));
            }
            let resolved = if feature.is_critical() {
                self.satisfied.contains(feature)
            } else {
                self.satisfied.contains(feature) || self.missing.contains(feature)
            };
            if !resolved {
                return Err(self
                    .missing_errors
                    .get(feature)
                    .cloned()
                    .unwrap_or_else(|| Error::not_available("feature is not ready")));
            }
        }
        Ok(())
    }

    /// Apply a status transition: new epoch, everything requested so far
    /// becomes pending again. Error records from the old epoch are cleared
    /// together with the sets they explain.
    fn apply_status(&mut self, status: u32) -> Effects {
        let mut effects = Effects::default();
        self.current_status = status;
        self.satisfied.clear();
        self.missing.clear();
        self.missing_errors.clear();
        self.pending = self.requested.clone();

        if self.supported_statuses.contains(&status) {
            self.wake_queued = true;
        } else {
            // No feature introspects under this status; it is settled as-is.
            for watcher in &self.status_watchers {
                effects.status_ready.push((watcher.clone(), status));
            }
        }
        effects
    }
}
