// Scheduler-level tests for the readiness engine. These drive a
// ReadinessHelper directly with recording introspect callbacks, so no bus
// connection is involved: the callbacks note what was dispatched and the test
// reports completions explicitly.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use telebus::{
    Error, Feature, Features, Introspectable, Introspectables, ReadinessHelper, Validity,
};

fn block_on<T>(fut: impl Future<Output = T>) -> T {
    #[cfg(feature = "rt-async-io")]
    {
        smol::block_on(fut)
    }

    #[cfg(feature = "rt-tokio")]
    {
        let rt = tokio::runtime::Runtime::new().expect("init tokio runtime");
        rt.block_on(fut)
    }
}

const CORE: Feature = Feature::critical("Test", 0);
const FEAT_A: Feature = Feature::new("Test", 1);
const FEAT_B: Feature = Feature::new("Test", 2);

#[derive(Clone, Default)]
struct DispatchLog {
    entries: Arc<Mutex<Vec<Feature>>>,
}

impl DispatchLog {
    fn recorder(&self, feature: Feature) -> impl Fn(ReadinessHelper) + Send + Sync + 'static {
        let entries = self.entries.clone();
        move |_helper| entries.lock().expect("log lock").push(feature)
    }

    fn take(&self) -> Vec<Feature> {
        std::mem::take(&mut *self.entries.lock().expect("log lock"))
    }
}

struct Harness {
    validity: Arc<Validity>,
    helper: ReadinessHelper,
    log: DispatchLog,
}

/// A helper whose features all apply to status 0 (the initial status):
/// `CORE` is critical with no dependencies, the others depend on what
/// `deps_of` says and require the interfaces `ifaces_of` says.
fn harness(entries: Vec<(Feature, Features, Vec<&str>, bool)>) -> Harness {
    let validity = Validity::new();
    let log = DispatchLog::default();
    let mut introspectables = Introspectables::new();
    for (feature, deps, ifaces, critical) in entries {
        let mut introspectable = Introspectable::new([0u32], deps, ifaces, log.recorder(feature));
        if critical {
            introspectable = introspectable.critical();
        }
        introspectables.insert(feature, introspectable);
    }
    let helper = ReadinessHelper::new(validity.clone(), 0, introspectables);
    Harness {
        validity,
        helper,
        log,
    }
}

#[test]
fn empty_requests_resolve_immediately() {
    let h = harness(vec![(CORE, Features::new(), vec![], true)]);
    let op = h.helper.become_ready(Features::new());
    assert!(op.is_finished());
    assert!(block_on(op).is_ok());
    assert!(h.log.take().is_empty());
}

#[test]
fn unsupported_features_fail_upfront() {
    let h = harness(vec![(CORE, Features::new(), vec![], true)]);
    let op = h.helper.become_ready(HashSet::from([Feature::new("Other", 9)]));
    assert!(op.is_finished());
    let result = block_on(op);
    let Err(Error::InvalidArgument { .. }) = result else {
        panic!("unexpected result: {result:?}");
    };
}

#[test]
fn single_feature_lifecycle() {
    let h = harness(vec![(CORE, Features::new(), vec![], true)]);
    let op = h.helper.become_ready(HashSet::from([CORE]));
    assert_eq!(h.log.take(), vec![CORE]);
    assert!(!op.is_finished());

    h.helper.set_introspect_completed(&CORE, Ok(()));
    assert!(op.is_finished());
    assert!(block_on(op).is_ok());
    assert!(h.helper.actual_features().contains(&CORE));
    assert!(h.helper.is_ready(&HashSet::from([CORE])));
}

// Scenario: a feature whose required interface the remote object does not
// implement resolves as missing without its callback ever running; whether
// the request fails depends on the feature's criticality.
#[test]
fn interface_gating_marks_features_missing() {
    let critical_x = Feature::critical("Test", 7);
    let h = harness(vec![
        (CORE, Features::new(), vec![], true),
        (critical_x, HashSet::from([CORE]), vec!["im.example.Foo"], true),
    ]);
    h.helper.set_interfaces(Vec::new());

    let op = h.helper.become_ready(HashSet::from([CORE, critical_x]));
    assert_eq!(h.log.take(), vec![CORE]);
    h.helper.set_introspect_completed(&CORE, Ok(()));

    // X never dispatched, yet everything resolved.
    assert!(h.log.take().is_empty());
    assert!(op.is_finished());
    let result = block_on(op);
    let Err(Error::NotAvailable { .. }) = result else {
        panic!("critical missing feature must fail the request: {result:?}");
    };
    assert!(h.helper.actual_features().contains(&CORE));
    assert!(h.helper.missing_features().contains(&critical_x));
    assert!(h.helper.missing_feature_error(&critical_x).is_some());
}

#[test]
fn non_critical_missing_features_still_resolve_the_request() {
    let h = harness(vec![
        (CORE, Features::new(), vec![], true),
        (FEAT_A, HashSet::from([CORE]), vec!["im.example.Foo"], false),
    ]);
    h.helper.set_interfaces(Vec::new());

    let op = h.helper.become_ready(HashSet::from([CORE, FEAT_A]));
    h.helper.set_introspect_completed(&CORE, Ok(()));

    assert!(block_on(op).is_ok());
    assert!(h.helper.missing_features().contains(&FEAT_A));
    // is_ready still holds: the caller consults missing_features for the gap.
    assert!(h.helper.is_ready(&HashSet::from([CORE, FEAT_A])));
}

// Scenario: independent features are dispatched in the same pass once their
// shared dependency resolves, so their remote calls overlap.
#[test]
fn independent_features_dispatch_concurrently() {
    let h = harness(vec![
        (CORE, Features::new(), vec![], true),
        (FEAT_A, HashSet::from([CORE]), vec![], false),
        (FEAT_B, HashSet::from([CORE]), vec![], false),
    ]);

    let op = h.helper.become_ready(HashSet::from([FEAT_A, FEAT_B]));
    // The dependency is folded in and introspected first.
    assert_eq!(h.log.take(), vec![CORE]);

    h.helper.set_introspect_completed(&CORE, Ok(()));
    let mut batch = h.log.take();
    batch.sort_by_key(Feature::id);
    assert_eq!(batch, vec![FEAT_A, FEAT_B]);
    assert!(!op.is_finished());

    h.helper.set_introspect_completed(&FEAT_A, Ok(()));
    assert!(!op.is_finished());
    h.helper.set_introspect_completed(&FEAT_B, Ok(()));
    assert!(block_on(op).is_ok());
}

// Scenario: a status change while introspection is in flight is deferred; the
// new epoch starts only after the old epoch's completion lands, and the still
// outstanding request is re-run from scratch under the new status.
#[test]
fn status_changes_defer_until_in_flight_work_drains() {
    let validity = Validity::new();
    let log = DispatchLog::default();
    let mut introspectables = Introspectables::new();
    introspectables.insert(
        FEAT_A,
        Introspectable::new([0u32, 1], Features::new(), Vec::<String>::new(), log.recorder(FEAT_A)),
    );
    let helper = ReadinessHelper::new(validity, 0, introspectables);

    let op = helper.become_ready(HashSet::from([FEAT_A]));
    assert_eq!(log.take(), vec![FEAT_A]);

    helper.set_current_status(1);
    // Deferred: the old status is still observable.
    assert_eq!(helper.current_status(), 0);

    helper.set_introspect_completed(&FEAT_A, Ok(()));
    // The old epoch's result is discarded; the new epoch re-runs A.
    assert_eq!(helper.current_status(), 1);
    assert!(!op.is_finished());
    assert!(!helper.actual_features().contains(&FEAT_A));
    assert_eq!(log.take(), vec![FEAT_A]);

    helper.set_introspect_completed(&FEAT_A, Ok(()));
    assert!(block_on(op).is_ok());
}

// Scenario: identical feature sets requested back-to-back share one
// operation.
#[test]
fn equal_requests_share_the_same_operation() {
    let h = harness(vec![(CORE, Features::new(), vec![], true)]);
    let first = h.helper.become_ready(HashSet::from([CORE]));
    let second = h.helper.become_ready(HashSet::from([CORE]));
    assert!(first.is_same_operation(&second));
    // Only one dispatch happened.
    assert_eq!(h.log.take(), vec![CORE]);

    // A different set is a different operation.
    let h2 = harness(vec![
        (CORE, Features::new(), vec![], true),
        (FEAT_A, HashSet::from([CORE]), vec![], false),
    ]);
    let lone = h2.helper.become_ready(HashSet::from([CORE]));
    let wider = h2.helper.become_ready(HashSet::from([CORE, FEAT_A]));
    assert!(!lone.is_same_operation(&wider));
}

// Scenario: invalidation mid-flight fails the outstanding request with the
// invalidation pair; late completions for abandoned features are ignored.
#[test]
fn invalidation_aborts_outstanding_requests() {
    let h = harness(vec![
        (FEAT_A, Features::new(), vec![], false),
        (FEAT_B, Features::new(), vec![], false),
    ]);

    let op = h.helper.become_ready(HashSet::from([FEAT_A, FEAT_B]));
    let mut batch = h.log.take();
    batch.sort_by_key(Feature::id);
    assert_eq!(batch, vec![FEAT_A, FEAT_B]);

    h.helper.set_introspect_completed(&FEAT_A, Ok(()));
    assert!(!op.is_finished());

    h.validity
        .invalidate("im.example.Error.Gone", "simulated crash");
    h.helper
        .notify_invalidated("im.example.Error.Gone", "simulated crash");

    let result = block_on(op.clone());
    let Err(Error::Invalidated { name, message }) = result else {
        panic!("unexpected result: {result:?}");
    };
    assert_eq!(name, "im.example.Error.Gone");
    assert_eq!(message, "simulated crash");

    // B's completion arrives late and is dropped on the floor.
    h.helper.set_introspect_completed(&FEAT_B, Ok(()));
    assert!(h.helper.actual_features().is_empty());

    // New requests fail immediately with the same pair.
    let late = h.helper.become_ready(HashSet::from([FEAT_A]));
    assert!(late.is_finished());
    assert!(matches!(block_on(late), Err(Error::Invalidated { .. })));
}

// Scenario: a sibling proxy discovers the status on the requester's behalf,
// the way a roster manager starts at an unknown status until the connection's
// core introspection reports the real one. Requests parked under the unknown
// status must start running once the status is forced.
#[test]
fn forced_status_discovery_wakes_parked_requests() {
    let validity = Validity::new();
    let log = DispatchLog::default();
    let mut introspectables = Introspectables::new();
    introspectables.insert(
        CORE,
        Introspectable::new([0u32], Features::new(), Vec::<String>::new(), log.recorder(CORE))
            .critical(),
    );
    let helper = ReadinessHelper::new(validity, u32::MAX, introspectables);

    let op = helper.become_ready(HashSet::from([CORE]));
    // Nothing dispatches while the status is unknown.
    assert!(log.take().is_empty());
    assert!(!op.is_finished());

    // Retrying joins the parked operation instead of forking a new one.
    let retry = helper.become_ready(HashSet::from([CORE]));
    assert!(retry.is_same_operation(&op));

    helper.force_current_status(0);
    assert_eq!(log.take(), vec![CORE]);
    helper.set_introspect_completed(&CORE, Ok(()));
    assert!(block_on(op).is_ok());
}

// The scheduler records the invalidation pair itself, so a request racing the
// separately locked validity record still fails with the pair instead of
// lingering until the helper is destroyed.
#[test]
fn requests_racing_an_invalidation_fail_with_the_pair() {
    let h = harness(vec![(CORE, Features::new(), vec![], true)]);
    let op = h.helper.become_ready(HashSet::from([CORE]));
    assert_eq!(h.log.take(), vec![CORE]);

    // The notification lands before the validity record is updated.
    h.helper
        .notify_invalidated("im.example.Error.Gone", "simulated crash");

    let result = block_on(op);
    let Err(Error::Invalidated { name, .. }) = result else {
        panic!("unexpected result: {result:?}");
    };
    assert_eq!(name, "im.example.Error.Gone");

    let late = h.helper.become_ready(HashSet::from([CORE]));
    assert!(late.is_finished());
    let result = block_on(late);
    let Err(Error::Invalidated { name, message }) = result else {
        panic!("unexpected result: {result:?}");
    };
    assert_eq!(name, "im.example.Error.Gone");
    assert_eq!(message, "simulated crash");

    // The abandoned completion changes nothing.
    h.helper.set_introspect_completed(&CORE, Ok(()));
    assert!(h.helper.actual_features().is_empty());
    assert!(!h.helper.is_ready(&HashSet::from([CORE])));
}

#[test]
fn failed_dependencies_propagate_to_dependents() {
    let strict = Feature::critical("Test", 5);
    let h = harness(vec![
        (CORE, Features::new(), vec![], true),
        (strict, HashSet::from([CORE]), vec![], true),
    ]);

    let op = h.helper.become_ready(HashSet::from([strict]));
    assert_eq!(h.log.take(), vec![CORE]);
    h.helper.set_introspect_completed(
        &CORE,
        Err(Error::DbusError {
            name: "im.example.Error.Failed".to_string(),
            message: "backend exploded".to_string(),
        }),
    );

    // The dependent was never dispatched; it is missing by propagation.
    assert!(h.log.take().is_empty());
    assert!(h.helper.missing_features().contains(&strict));
    let result = block_on(op);
    let Err(Error::NotAvailable { .. }) = result else {
        panic!("unexpected result: {result:?}");
    };
    // The dependency's own failure is preserved verbatim.
    let dep_err = h.helper.missing_feature_error(&CORE).expect("recorded");
    assert!(matches!(dep_err, Error::DbusError { .. }));
}

#[test]
fn inapplicable_features_are_vacuously_satisfied() {
    let validity = Validity::new();
    let log = DispatchLog::default();
    let mut introspectables = Introspectables::new();
    introspectables.insert(
        CORE,
        Introspectable::new([0u32], Features::new(), Vec::<String>::new(), log.recorder(CORE))
            .critical(),
    );
    // Only applies to status 1, but the object stays in status 0.
    introspectables.insert(
        FEAT_A,
        Introspectable::new([1u32], Features::new(), Vec::<String>::new(), log.recorder(FEAT_A)),
    );
    let helper = ReadinessHelper::new(validity, 0, introspectables);

    let op = helper.become_ready(HashSet::from([CORE, FEAT_A]));
    assert_eq!(log.take(), vec![CORE]);
    helper.set_introspect_completed(&CORE, Ok(()));

    assert!(block_on(op).is_ok());
    assert!(helper.actual_features().contains(&FEAT_A));
    // A was satisfied without its callback running.
    assert!(log.take().is_empty());
}

#[test]
fn status_ready_fires_once_everything_requested_resolves() {
    let h = harness(vec![(CORE, Features::new(), vec![], true)]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.helper
        .on_status_ready(move |status| sink.lock().expect("seen lock").push(status));

    let _op = h.helper.become_ready(HashSet::from([CORE]));
    assert!(seen.lock().expect("seen lock").is_empty());

    h.helper.set_introspect_completed(&CORE, Ok(()));
    assert_eq!(*seen.lock().expect("seen lock"), vec![0]);

    // A transition to a status no feature applies to settles immediately.
    h.helper.set_current_status(9);
    assert_eq!(*seen.lock().expect("seen lock"), vec![0, 9]);
}

#[test]
fn dropping_the_helper_cancels_outstanding_requests() {
    let op = {
        let h = harness(vec![(CORE, Features::new(), vec![], true)]);
        let op = h.helper.become_ready(HashSet::from([CORE]));
        assert!(!op.is_finished());
        op
        // h (the only helper handle) drops here.
    };
    assert!(op.is_finished());
    let result = block_on(op);
    let Err(Error::Cancelled { .. }) = result else {
        panic!("unexpected result: {result:?}");
    };
}

#[test]
fn epoch_reset_clears_satisfied_and_error_records() {
    let validity = Validity::new();
    let log = DispatchLog::default();
    let mut introspectables = Introspectables::new();
    introspectables.insert(
        FEAT_A,
        Introspectable::new([0u32, 1], Features::new(), Vec::<String>::new(), log.recorder(FEAT_A)),
    );
    let helper = ReadinessHelper::new(validity, 0, introspectables);

    let first = helper.become_ready(HashSet::from([FEAT_A]));
    log.take();
    helper.set_introspect_completed(&FEAT_A, Err(Error::NotAvailable {
        context: "not this time".to_string(),
    }));
    assert!(block_on(first).is_ok());
    assert!(helper.missing_features().contains(&FEAT_A));
    assert!(helper.missing_feature_error(&FEAT_A).is_some());

    // Reconnect-style status flip: sets and error records start fresh and
    // the already-requested feature is introspected again.
    helper.set_current_status(1);
    assert!(helper.missing_features().is_empty());
    assert!(helper.missing_feature_error(&FEAT_A).is_none());
    assert_eq!(log.take(), vec![FEAT_A]);
}
