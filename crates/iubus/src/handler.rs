//! Event handler registry shared by both buffer kinds.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use iubus_core::{EventMask, IuEventType};

use crate::iu::Iu;

/// Handler callback: the IU, the event type, and whether the event was
/// caused by a write that arrived at this (owning) buffer.
pub type HandlerFn = dyn Fn(&Iu, IuEventType, bool) -> anyhow::Result<()> + Send + Sync;

struct HandlerEntry {
    handler: Arc<HandlerFn>,
    mask: EventMask,
    /// Empty means every category.
    categories: BTreeSet<String>,
}

impl HandlerEntry {
    fn matches(&self, event: IuEventType, category: &str) -> bool {
        self.mask.contains(event) && (self.categories.is_empty() || self.categories.contains(category))
    }
}

/// Ordered list of handlers with their event and category filters.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    entries: RwLock<Vec<Arc<HandlerEntry>>>,
}

impl HandlerRegistry {
    pub(crate) fn register(
        &self,
        handler: Arc<HandlerFn>,
        mask: EventMask,
        categories: BTreeSet<String>,
    ) {
        self.entries.write().push(Arc::new(HandlerEntry {
            handler,
            mask,
            categories,
        }));
    }

    /// Invoke every matching handler in registration order.
    ///
    /// Handlers run without the registry lock held, so they may register
    /// further handlers. A failing or panicking handler is logged and does
    /// not stop the others. Returns the number of handlers invoked.
    pub(crate) fn dispatch(&self, iu: &Iu, event: IuEventType, local: bool) -> usize {
        let entries: Vec<Arc<HandlerEntry>> = self.entries.read().clone();
        let category = iu.category();
        let mut invoked = 0;

        for entry in entries.iter().filter(|e| e.matches(event, category)) {
            invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(iu, event, local))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(uid = iu.uid(), %event, error = %e, "event handler failed");
                }
                Err(_) => {
                    tracing::error!(uid = iu.uid(), %event, "event handler panicked");
                }
            }
        }
        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<HandlerFn> {
        let log = Arc::clone(log);
        Arc::new(move |_: &Iu, event: IuEventType, _: bool| -> anyhow::Result<()> {
            log.lock().push(format!("{}:{}", name, event));
            Ok(())
        })
    }

    #[test]
    fn test_dispatch_filters_by_mask_and_category() {
        let registry = HandlerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(recorder(&log, "all"), EventMask::ALL, BTreeSet::new());
        registry.register(
            recorder(&log, "added"),
            IuEventType::Added.into(),
            BTreeSet::new(),
        );
        registry.register(
            recorder(&log, "other"),
            EventMask::ALL,
            ["other".to_string()].into_iter().collect(),
        );

        let iu = Iu::fake("cat1");
        assert_eq!(registry.dispatch(&iu, IuEventType::Added, false), 2);
        assert_eq!(registry.dispatch(&iu, IuEventType::Updated, false), 1);
        assert_eq!(
            *log.lock(),
            vec!["all:ADDED", "added:ADDED", "all:UPDATED"]
        );
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let registry = HandlerRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            Arc::new(|_: &Iu, _: IuEventType, _: bool| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("boom"))
            }),
            EventMask::ALL,
            BTreeSet::new(),
        );
        registry.register(
            Arc::new(|_: &Iu, _: IuEventType, _: bool| -> anyhow::Result<()> {
                panic!("handler bug")
            }),
            EventMask::ALL,
            BTreeSet::new(),
        );
        registry.register(recorder(&log, "last"), EventMask::ALL, BTreeSet::new());

        let iu = Iu::fake("cat1");
        assert_eq!(registry.dispatch(&iu, IuEventType::Committed, true), 3);
        assert_eq!(*log.lock(), vec!["last:COMMITTED"]);
    }
}
