use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{ClientId, CommunicationData, InfoType};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::trace;

type HandlerFn = dyn Fn(ClientId, CommunicationData) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Message-kind dispatch table.
///
/// Every [`InfoType`] the incoming pools can see is mapped explicitly to one handler;
/// a kind with no registered handler is rejected with `UnexpectedMessage`.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<InfoType, Arc<HandlerFn>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register (or replace) the handler for one message kind.
    pub fn register<F>(&self, kind: InfoType, handler: F) -> Result<()>
    where
        F: Fn(ClientId, CommunicationData) -> BoxFuture<'static, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    pub fn has_handler(&self, kind: InfoType) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Route `data` to the handler for its kind.
    pub async fn dispatch(&self, client_id: ClientId, data: CommunicationData) -> Result<()> {
        let kind = data.info_type();
        let handler = {
            let handlers = self.handlers.read().map_err(|_| {
                ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            handlers
                .get(&kind)
                .cloned()
                .ok_or(ProtocolError::UnexpectedMessage)?
        };

        trace!(client_id, info_type = %kind, "Dispatching message");
        handler(client_id, data).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::protocol::message::Priority;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(AtomicU64::new(0));

        let counter = seen.clone();
        dispatcher
            .register(InfoType::Normal, move |client, _| {
                counter.store(client, Ordering::SeqCst);
                async { Ok(()) }.boxed()
            })
            .unwrap();

        dispatcher
            .dispatch(7, CommunicationData::normal("hi", Priority::Low))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(dispatcher.has_handler(InfoType::Normal));
        assert!(!dispatcher.has_handler(InfoType::Heartbeat));
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_unexpected() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher.dispatch(1, CommunicationData::heartbeat()).await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedMessage)));
    }
}
