//! Capability boundary to the platform bridging framework.
//!
//! Every call may take hundreds of milliseconds and may fail. Handles returned by the
//! platform are wrapped in single-owner types whose `close` is idempotent.

use crate::config::{BridgeNetworkConfig, VlanRouterConfig};
use crate::error::BridgeError;

/// Platform bridging API.
pub trait NativeBridge: Send + Sync {
    fn new_bridge(&self, config: &BridgeNetworkConfig) -> Result<Box<dyn HostBridge>, BridgeError>;

    fn new_vlan_router(&self, config: &VlanRouterConfig) -> Result<Box<dyn VlanRouter>, BridgeError>;
}

/// One host-visible bridge attached to a guest fd.
pub trait HostBridge: Send {
    fn close(&mut self) -> Result<(), BridgeError>;
}

/// Multiplexes many bridges behind one guest-facing fd. Indices are assigned by the router.
pub trait VlanRouter: Send {
    fn add_bridge(&mut self, config: &BridgeNetworkConfig) -> Result<usize, BridgeError>;

    fn remove_bridge(&mut self, index: usize) -> Result<(), BridgeError>;

    fn renew_bridge(&mut self, index: usize) -> Result<(), BridgeError>;

    fn clear_bridges(&mut self) -> Result<(), BridgeError>;

    fn close(&mut self) -> Result<(), BridgeError>;
}

/// Owned bridge. Closing twice is a no-op; dropping an open handle closes it.
pub struct BridgeHandle {
    inner: Option<Box<dyn HostBridge>>,
    label: String,
}

impl BridgeHandle {
    pub fn new(inner: Box<dyn HostBridge>, label: impl Into<String>) -> Self {
        Self {
            inner: Some(inner),
            label: label.into(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn close(&mut self) -> Result<(), BridgeError> {
        match self.inner.take() {
            Some(mut b) => b.close(),
            None => Ok(()),
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::debug!(bridge = %self.label, "closing bridge on drop");
            if let Err(e) = self.close() {
                tracing::warn!(bridge = %self.label, error = %e, "failed to close bridge");
            }
        }
    }
}

/// Owned VLAN router with the same close discipline as [`BridgeHandle`].
pub struct RouterHandle {
    inner: Option<Box<dyn VlanRouter>>,
}

impl RouterHandle {
    pub fn new(inner: Box<dyn VlanRouter>) -> Self {
        Self { inner: Some(inner) }
    }

    fn router(&mut self) -> Result<&mut Box<dyn VlanRouter>, BridgeError> {
        self.inner
            .as_mut()
            .ok_or_else(|| BridgeError::Native("vlan router closed".to_string()))
    }

    pub fn add_bridge(&mut self, config: &BridgeNetworkConfig) -> Result<usize, BridgeError> {
        self.router()?.add_bridge(config)
    }

    pub fn remove_bridge(&mut self, index: usize) -> Result<(), BridgeError> {
        self.router()?.remove_bridge(index)
    }

    pub fn renew_bridge(&mut self, index: usize) -> Result<(), BridgeError> {
        self.router()?.renew_bridge(index)
    }

    pub fn clear_bridges(&mut self) -> Result<(), BridgeError> {
        self.router()?.clear_bridges()
    }

    pub fn close(&mut self) -> Result<(), BridgeError> {
        match self.inner.take() {
            Some(mut r) => r.close(),
            None => Ok(()),
        }
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close vlan router");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBridge(Arc<AtomicUsize>);

    impl HostBridge for CountingBridge {
        fn close(&mut self) -> Result<(), BridgeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_bridge_handle_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = BridgeHandle::new(Box::new(CountingBridge(closes.clone())), "test");
        handle.close().unwrap();
        handle.close().unwrap();
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bridge_handle_closes_on_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let handle = BridgeHandle::new(Box::new(CountingBridge(closes.clone())), "test");
            assert!(handle.is_open());
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
