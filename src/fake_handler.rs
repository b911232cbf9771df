use crate::proxy::Validity;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, Weak};

use zbus::zvariant::OwnedObjectPath;

/// A channel currently claimed as handled, held weakly so dropped or
/// invalidated proxies fall out of the registry on the next access.
pub(crate) struct TrackedChannel {
    path: OwnedObjectPath,
    validity: Weak<Validity>,
}

impl TrackedChannel {
    pub(crate) fn new(path: OwnedObjectPath, validity: Weak<Validity>) -> Self {
        Self { path, validity }
    }

    fn is_live(&self) -> bool {
        self.validity.upgrade().is_some_and(|v| v.is_valid())
    }
}

/// Process-wide registry backing the `HandledChannels` property of every
/// handler registered on a given bus connection.
///
/// The dispatcher reads that property to avoid re-dispatching channels a
/// client already handles, so entries must disappear as soon as their channel
/// closes or its proxy is dropped. Keyed by the unique bus name the handler
/// was registered on.
pub(crate) struct FakeHandlerManager {
    handlers: Mutex<HashMap<String, Vec<TrackedChannel>>>,
}

impl FakeHandlerManager {
    pub(crate) fn instance() -> &'static Self {
        static INSTANCE: OnceLock<FakeHandlerManager> = OnceLock::new();
        INSTANCE.get_or_init(|| Self {
            handlers: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register_channels(
        &self,
        owner: &str,
        channels: impl IntoIterator<Item = TrackedChannel>,
    ) {
        let mut handlers = self.lock();
        let tracked = handlers.entry(owner.to_string()).or_default();
        tracked.retain(TrackedChannel::is_live);
        for channel in channels {
            if tracked.iter().any(|existing| existing.path == channel.path) {
                continue;
            }
            tracked.push(channel);
        }
    }

    /// Paths of the live channels `owner` handles. Dead entries (and owners
    /// left with none) are pruned on the way.
    pub(crate) fn handled_channels(&self, owner: &str) -> Vec<OwnedObjectPath> {
        let mut handlers = self.lock();
        let Some(tracked) = handlers.get_mut(owner) else {
            return Vec::new();
        };
        tracked.retain(TrackedChannel::is_live);
        if tracked.is_empty() {
            handlers.remove(owner);
            return Vec::new();
        }
        tracked.iter().map(|channel| channel.path.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<TrackedChannel>>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
