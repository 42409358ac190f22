//! Backend connection boundary.

use crate::error::AdapterResult;
use basket_core::{AdapterId, Capabilities, Message};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A backend connection as the router sees it.
///
/// `send_in` must not block: implementations enqueue onto their own task
/// (or answer inline through the bound channel). Replies are delivered on
/// the channel given to `bind`, in the order the backend produced them.
pub trait MessageAdapter: Send + Sync {
    /// Stable identity. Wrappers report the identity of what they wrap.
    fn id(&self) -> AdapterId;

    fn name(&self) -> &str;

    /// Current capability descriptor.
    fn capabilities(&self) -> Capabilities;

    /// Hand a message to the backend.
    fn send_in(&self, message: Message) -> AdapterResult<()>;

    /// Route outbound messages to `out`, replacing any previous channel.
    fn bind(&self, out: mpsc::UnboundedSender<Message>);

    /// Fresh, unconnected copy with the same settings.
    fn clone_adapter(&self) -> Arc<dyn MessageAdapter>;

    /// Wrapped adapter, for decorators.
    fn inner(&self) -> Option<Arc<dyn MessageAdapter>> {
        None
    }

    /// Unwrapping stops at an adapter that reports `true`.
    fn presents_as_backend(&self) -> bool {
        self.inner().is_none()
    }
}

/// Innermost adapter, stopping at one that presents itself as the backend.
pub fn underlying_adapter(adapter: &Arc<dyn MessageAdapter>) -> Arc<dyn MessageAdapter> {
    let mut current = adapter.clone();
    while !current.presents_as_backend() {
        match current.inner() {
            Some(inner) => current = inner,
            None => break,
        }
    }
    current
}
