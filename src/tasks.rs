use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Named background-task registry held by a proxy.
///
/// Keyed by task name, so re-dispatching under the same name replaces (and
/// thereby reaps) the handle the previous dispatch left behind instead of
/// growing a list: the registry never holds more handles than there are
/// distinct task names. The scheduler only re-dispatches a feature after its
/// previous run reported completion, so a replaced handle is always finished.
/// Dropping the registry cancels whatever is still running.
pub(crate) struct TaskSet<T = zbus::Task<()>> {
    tasks: Mutex<HashMap<String, T>>,
}

impl<T> TaskSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, name: &str, task: T) {
        self.lock().insert(name.to_string(), task);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, T>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
