use crate::errors::InvalidContext;
use crate::schema::PersistedWork;
use crate::work::{PersistableWork, Work};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A boxed work runnable by a queue with environment `Env`.
pub type BoxedWork<Env> = Box<dyn Work<Env = Env>>;

type RestoreFn<Env> =
    Arc<dyn Fn(&str, Option<&[u8]>) -> Result<BoxedWork<Env>, InvalidContext> + Send + Sync>;

/// Maps type identifiers of persisted records to the factories rebuilding them.
pub struct WorkRegistry<Env> {
    factories: HashMap<String, RestoreFn<Env>>,
}

impl<Env> Default for WorkRegistry<Env> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<Env> Clone for WorkRegistry<Env> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

impl<Env> fmt::Debug for WorkRegistry<Env> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkRegistry")
            .field("type_identifiers", &self.type_identifiers())
            .finish()
    }
}

impl<Env: Clone + Send + Sync + 'static> WorkRegistry<Env> {
    /// Register a persistable work type under its `TYPE_IDENTIFIER`.
    pub fn register<W: PersistableWork<Env = Env>>(&mut self) {
        self.register_with(W::TYPE_IDENTIFIER, |id, context| {
            W::restore(id, context).map(|work| Box::new(work) as BoxedWork<Env>)
        });
    }

    /// Register a custom factory for `type_identifier`.
    ///
    /// A later registration for the same identifier replaces the earlier one.
    pub fn register_with<F>(&mut self, type_identifier: impl Into<String>, factory: F)
    where
        F: Fn(&str, Option<&[u8]>) -> Result<BoxedWork<Env>, InvalidContext>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(type_identifier.into(), Arc::new(factory));
    }

    /// Rebuild the work described by `record`.
    ///
    /// Returns `None` if no factory is registered for its type identifier.
    pub fn restore(
        &self,
        record: &PersistedWork,
    ) -> Option<Result<BoxedWork<Env>, InvalidContext>> {
        let factory = self.factories.get(&record.type_identifier)?;
        Some(factory(&record.id, record.context.as_deref()))
    }
}

impl<Env> WorkRegistry<Env> {
    /// All registered type identifiers, sorted.
    pub fn type_identifiers(&self) -> Vec<&str> {
        let mut identifiers: Vec<_> = self.factories.keys().map(String::as_str).collect();
        identifiers.sort_unstable();
        identifiers
    }
}
