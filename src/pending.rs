use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use crate::error::Result;
use crate::feature::Features;

/// Future representing one `become_ready` request.
///
/// Resolves exactly once, to `Ok(())` when every requested feature passed the
/// readiness check, or to the first failing feature's error. Handles are
/// cheap to clone; clones returned for deduplicated `become_ready` calls
/// share the same underlying operation (see
/// [`PendingReady::is_same_operation`]) and all observe the same resolution.
#[derive(Clone, Debug)]
pub struct PendingReady {
    requested: Features,
    shared: Arc<OperationShared>,
}

impl PendingReady {
    pub(crate) fn new(requested: Features, shared: Arc<OperationShared>) -> Self {
        Self { requested, shared }
    }

    /// An operation that is already resolved, used for requests that fail
    /// before any scheduling happens (unsupported features, invalidated
    /// proxy).
    pub(crate) fn finished(requested: Features, result: Result<()>) -> Self {
        let shared = OperationShared::new();
        shared.finish(result);
        Self { requested, shared }
    }

    /// The exact feature set this operation was created for.
    pub fn requested_features(&self) -> &Features {
        &self.requested
    }

    /// Whether the operation has resolved (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.shared.lock().result.is_some()
    }

    /// Whether two handles refer to the same underlying operation.
    pub fn is_same_operation(&self, other: &PendingReady) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Future for PendingReady {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Single-resolution cell shared between a [`PendingReady`] handle (and its
/// clones) and the scheduler's bookkeeping entry.
#[derive(Debug)]
pub(crate) struct OperationShared {
    state: Mutex<OperationState>,
}

#[derive(Debug, Default)]
struct OperationState {
    result: Option<Result<()>>,
    wakers: Vec<Waker>,
}

impl OperationShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OperationState::default()),
        })
    }

    /// Record the resolution and wake all pollers. Later calls are no-ops:
    /// the normal completion path and the destroyed-while-pending path may
    /// both reach here for the same operation.
    pub(crate) fn finish(&self, result: Result<()>) {
        let wakers = {
            let mut state = self.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn lock(&self) -> MutexGuard<'_, OperationState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OperationShared {
    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<Result<()>> {
        self.lock().result.clone()
    }
}
