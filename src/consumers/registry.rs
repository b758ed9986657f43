use crate::{consumers::Handler, error::ConfigurationError, settings::QueueBinding};
use std::{collections::HashMap, fmt, sync::Arc};

/// Handlers, indexed by the name queue bindings refer to them with.
///
/// The registry is built once, before the [`Manager`](crate::Manager) is, and it is read-only
/// afterwards.
///
/// ```
/// use carrot_patch::consumers::{BrokerAction, Handler, HandlerRegistry, Incoming};
/// use carrot_patch::error::HandlerError;
///
/// struct LogHandler;
///
/// #[async_trait::async_trait]
/// impl Handler for LogHandler {
///     async fn handle(&self, incoming: &Incoming) -> Result<BrokerAction, HandlerError> {
///         println!("{}", String::from_utf8_lossy(&incoming.body));
///         Ok(BrokerAction::Ack)
///     }
/// }
///
/// let registry = HandlerRegistry::new().with_handler("LogHandler", LogHandler);
/// assert!(registry.get("LogHandler").is_some());
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any handler previously registered with the
    /// same name.
    #[must_use]
    pub fn with_handler<H: Handler>(self, name: impl Into<String>, handler: H) -> Self {
        self.with_dyn_handler(name, Arc::new(handler))
    }

    /// A version of [`HandlerRegistry::with_handler`] for already Arc-ed handlers.
    #[must_use]
    pub fn with_dyn_handler(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    /// Find the handler `binding` refers to.
    pub fn resolve(&self, binding: &QueueBinding) -> Result<Arc<dyn Handler>, ConfigurationError> {
        self.get(&binding.handler)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownHandler {
                queue: binding.queue.clone(),
                handler: binding.handler.clone(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}
