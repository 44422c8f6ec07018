//! Identity resolution
//!
//! The resolver is the single source of truth for whose data the engine is
//! currently serving. Queue items and cache entries carry the identity they
//! were written under and are only surfaced while it is the current one.

use tokio::sync::watch;
use tracing::info;

/// Supplies the currently valid actor identity and signals changes
pub trait IdentityResolver: Send + Sync {
    /// The current identity, `None` when signed out
    fn current(&self) -> Option<String>;

    /// A receiver that observes every identity change
    fn subscribe(&self) -> watch::Receiver<Option<String>>;

    /// True when `identity` is the currently valid one
    fn is_current(&self, identity: &str) -> bool {
        self.current().as_deref() == Some(identity)
    }
}

/// Identity holder the application updates on sign-in / sign-out
pub struct IdentityHandle {
    sender: watch::Sender<Option<String>>,
}

impl IdentityHandle {
    pub fn new(initial: Option<String>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn signed_in(identity: impl Into<String>) -> Self {
        Self::new(Some(identity.into()))
    }

    pub fn signed_out() -> Self {
        Self::new(None)
    }

    /// Switch to a new identity. No-op when it is already current.
    pub fn set(&self, identity: impl Into<String>) {
        let identity = identity.into();
        self.sender.send_if_modified(|current| {
            if current.as_deref() == Some(identity.as_str()) {
                return false;
            }
            info!("identity changed to {}", identity);
            *current = Some(identity);
            true
        });
    }

    pub fn clear(&self) {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                return false;
            }
            info!("identity cleared");
            *current = None;
            true
        });
    }
}

impl IdentityResolver for IdentityHandle {
    fn current(&self) -> Option<String> {
        self.sender.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.sender.subscribe()
    }
}
