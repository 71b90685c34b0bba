//! In-memory doubles for the native bridge API and the route source.

use crate::config::{BridgeNetworkConfig, VlanRouterConfig};
use crate::error::BridgeError;
use crate::native::{HostBridge, NativeBridge, VlanRouter};
use crate::prefix::MacAddr;
use crate::route::{RouteChange, RouteSource, RouteTable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Call counters shared between a [`FakeNativeBridge`] and everything it created.
#[derive(Debug, Default)]
pub struct FakeCounters {
    pub bridges_created: AtomicUsize,
    pub bridges_closed: AtomicUsize,
    pub routers_created: AtomicUsize,
    pub routers_closed: AtomicUsize,
    pub vlan_added: AtomicUsize,
    pub vlan_removed: AtomicUsize,
    pub vlan_renewed: AtomicUsize,
    pub vlan_cleared: AtomicUsize,
}

impl FakeCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Native bridge double. Records every call, can be told to fail or to be slow.
#[derive(Default)]
pub struct FakeNativeBridge {
    pub counters: Arc<FakeCounters>,
    fail_new_bridge: Arc<AtomicBool>,
    fail_vlan: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    /// Configs passed to `new_bridge` and `add_bridge`, in order.
    pub created: Arc<Mutex<Vec<BridgeNetworkConfig>>>,
}

impl FakeNativeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_new_bridge(&self, fail: bool) {
        self.fail_new_bridge.store(fail, Ordering::SeqCst);
    }

    pub fn fail_vlan(&self, fail: bool) {
        self.fail_vlan.store(fail, Ordering::SeqCst);
    }

    /// Every native call sleeps this long first.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn created_configs(&self) -> Vec<BridgeNetworkConfig> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn slow(delay: &Mutex<Option<Duration>>) {
        let d = *delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(d) = d {
            std::thread::sleep(d);
        }
    }
}

impl NativeBridge for FakeNativeBridge {
    fn new_bridge(&self, config: &BridgeNetworkConfig) -> Result<Box<dyn HostBridge>, BridgeError> {
        Self::slow(&self.delay);
        if self.fail_new_bridge.load(Ordering::SeqCst) {
            return Err(BridgeError::Native("injected bridge failure".to_string()));
        }
        self.counters.bridges_created.fetch_add(1, Ordering::SeqCst);
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config.clone());
        Ok(Box::new(FakeHostBridge {
            counters: self.counters.clone(),
        }))
    }

    fn new_vlan_router(&self, config: &VlanRouterConfig) -> Result<Box<dyn VlanRouter>, BridgeError> {
        Self::slow(&self.delay);
        self.counters.routers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeVlanRouter {
            counters: self.counters.clone(),
            fail: self.fail_vlan.clone(),
            delay: self.delay.clone(),
            created: self.created.clone(),
            template: MacAddr([
                config.mac_prefix[0],
                config.mac_prefix[1],
                config.mac_prefix[2],
                config.mac_prefix[3],
                config.mac_prefix[4],
                0,
            ]),
            slots: vec![false; config.max_vlan_interfaces],
        }))
    }
}

struct FakeHostBridge {
    counters: Arc<FakeCounters>,
}

impl HostBridge for FakeHostBridge {
    fn close(&mut self) -> Result<(), BridgeError> {
        self.counters.bridges_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeVlanRouter {
    counters: Arc<FakeCounters>,
    fail: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    created: Arc<Mutex<Vec<BridgeNetworkConfig>>>,
    template: MacAddr,
    slots: Vec<bool>,
}

impl FakeVlanRouter {
    fn check(&self) -> Result<(), BridgeError> {
        FakeNativeBridge::slow(&self.delay);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::Native("injected vlan failure".to_string()));
        }
        Ok(())
    }
}

impl VlanRouter for FakeVlanRouter {
    fn add_bridge(&mut self, config: &BridgeNetworkConfig) -> Result<usize, BridgeError> {
        self.check()?;
        let index = self
            .slots
            .iter()
            .position(|used| !used)
            .ok_or_else(|| BridgeError::Native("no free vlan slots".to_string()))?;
        self.slots[index] = true;
        self.counters.vlan_added.fetch_add(1, Ordering::SeqCst);

        let mut config = config.clone();
        config.host_override_mac = self.template.with_index(index as u8);
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(config);
        Ok(index)
    }

    fn remove_bridge(&mut self, index: usize) -> Result<(), BridgeError> {
        self.check()?;
        match self.slots.get_mut(index) {
            Some(used) if *used => {
                *used = false;
                self.counters.vlan_removed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(BridgeError::IndexOutOfRange(index)),
        }
    }

    fn renew_bridge(&mut self, index: usize) -> Result<(), BridgeError> {
        self.check()?;
        if !self.slots.get(index).copied().unwrap_or(false) {
            return Err(BridgeError::IndexOutOfRange(index));
        }
        self.counters.vlan_renewed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_bridges(&mut self) -> Result<(), BridgeError> {
        self.slots.iter_mut().for_each(|s| *s = false);
        self.counters.vlan_cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BridgeError> {
        self.counters.routers_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Route source with a settable table and manually fired change events.
#[derive(Default)]
pub struct FakeRouteSource {
    table: Mutex<RouteTable>,
    subscribers: Mutex<Vec<mpsc::Sender<RouteChange>>>,
    reads: AtomicUsize,
}

impl FakeRouteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_table(&self, table: RouteTable) {
        *self.table.lock().unwrap_or_else(|e| e.into_inner()) = table;
    }

    /// Fires a change event to every live subscriber.
    pub fn notify(&self) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| !tx.is_closed());
        for tx in subs.iter() {
            let _ = tx.try_send(RouteChange);
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl RouteSource for FakeRouteSource {
    fn routing_table(&self) -> Result<RouteTable, BridgeError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.table.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn subscribe(&self) -> Result<mpsc::Receiver<RouteChange>, BridgeError> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Ok(rx)
    }
}
