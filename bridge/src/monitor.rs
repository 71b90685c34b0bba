//! Route conflict monitor.
//!
//! Watches the host routing table and renews bridges whose subnets are claimed by some
//! other route (VPNs, LAN changes). Renewals are rate limited and run on blocking
//! threads in parallel.

use crate::error::BridgeError;
use crate::prefix::{Ipv4Prefix, Ipv6Prefix};
use crate::route::{RouteChange, RouteSource, RouteTable};
use std::collections::VecDeque;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

/// VLAN router slots. The machine bridge is tracked in the slot after them.
pub const MAX_VLAN_INTERFACES: usize = 8;
pub const INDEX_SCON_MACHINE: usize = MAX_VLAN_INTERFACES;
const NUM_SLOTS: usize = MAX_VLAN_INTERFACES + 1;

const RENEW_LIMIT: usize = 10;
const RENEW_WINDOW: Duration = Duration::from_secs(8);
const DEBOUNCE: Duration = Duration::from_millis(100);
const DEFAULT_RESCAN: Duration = Duration::from_secs(30);

/// Recreates or re-registers a bridge. Runs on a blocking thread.
pub type RenewFn = Arc<dyn Fn() -> Result<(), BridgeError> + Send + Sync>;

/// What a renewal is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetState {
    /// Bridge is up; renew when another route starts claiming one of its families.
    Active,
    /// Bridge could not be created; renew once nothing claims it any more.
    Pending,
    /// Bridge is up without IPv4; renew when IPv4 frees up or IPv6 becomes claimed.
    DegradedV4,
}

struct MonitoredSubnet {
    ip4: Option<Ipv4Prefix>,
    ip6: Option<Ipv6Prefix>,
    renew: RenewFn,
    state: SubnetState,
    last_v4: bool,
    last_v6: bool,
    retry: bool,
    generation: u64,
}

impl MonitoredSubnet {
    /// Applies one table observation and reports whether a renewal is due.
    fn needs_renew(&self, v4: bool, v6: bool) -> bool {
        if self.retry {
            return match self.state {
                SubnetState::Active | SubnetState::DegradedV4 => true,
                SubnetState::Pending => !v4 && !v6,
            };
        }
        match self.state {
            SubnetState::Active => (v4 && !self.last_v4) || (v6 && !self.last_v6),
            SubnetState::Pending => !v4 && !v6,
            SubnetState::DegradedV4 => !v4 || (v6 && !self.last_v6),
        }
    }
}

/// Sliding-window token bucket on the tokio clock.
struct RenewLimiter {
    taken: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl RenewLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            taken: VecDeque::with_capacity(limit),
            limit,
            window,
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        while let Some(t) = self.taken.front() {
            if now.duration_since(*t) >= self.window {
                self.taken.pop_front();
            } else {
                break;
            }
        }
        if self.taken.len() >= self.limit {
            return false;
        }
        self.taken.push_back(now);
        true
    }
}

enum Wake {
    Event(bool),
    Scan,
}

struct Job {
    index: usize,
    generation: u64,
    renew: RenewFn,
}

/// Route conflict monitor for the machine bridge and the VLAN bridges.
pub struct RouteMon {
    subnets: Mutex<[Option<MonitoredSubnet>; NUM_SLOTS]>,
    limiter: tokio::sync::Mutex<RenewLimiter>,
    source: Arc<dyn RouteSource>,
    stop_tx: Mutex<Option<watch::Sender<()>>>,
    stop_rx: watch::Receiver<()>,
    rescan: Duration,
    next_generation: Mutex<u64>,
}

impl RouteMon {
    pub fn new(source: Arc<dyn RouteSource>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(());
        Self {
            subnets: Mutex::new(Default::default()),
            limiter: tokio::sync::Mutex::new(RenewLimiter::new(RENEW_LIMIT, RENEW_WINDOW)),
            source,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            rescan: DEFAULT_RESCAN,
            next_generation: Mutex::new(0),
        }
    }

    pub fn with_rescan_interval(mut self, rescan: Duration) -> Self {
        self.rescan = rescan;
        self
    }

    pub fn source(&self) -> &Arc<dyn RouteSource> {
        &self.source
    }

    /// Current routing table from the underlying source.
    pub fn routing_table(&self) -> Result<RouteTable, BridgeError> {
        self.source.routing_table()
    }

    fn lock_subnets(&self) -> std::sync::MutexGuard<'_, [Option<MonitoredSubnet>; NUM_SLOTS]> {
        self.subnets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Registers (or replaces) the subnet tracked in `index`.
    pub fn set_subnet(
        &self,
        index: usize,
        ip4: Option<Ipv4Prefix>,
        ip6: Option<Ipv6Prefix>,
        state: SubnetState,
        renew: RenewFn,
    ) -> Result<(), BridgeError> {
        if index >= NUM_SLOTS {
            return Err(BridgeError::IndexOutOfRange(index));
        }
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        let generation = {
            let mut g = self.next_generation.lock().unwrap_or_else(|e| e.into_inner());
            *g += 1;
            *g
        };
        let mut subnets = self.lock_subnets();
        subnets[index] = Some(MonitoredSubnet {
            ip4,
            ip6,
            renew,
            state,
            last_v4: false,
            last_v6: false,
            retry: false,
            generation,
        });
        tracing::debug!(index, ?ip4, ?ip6, ?state, "monitoring bridge subnet");
        Ok(())
    }

    pub fn clear_subnet(&self, index: usize) {
        if let Some(slot) = self.lock_subnets().get_mut(index)
            && slot.take().is_some()
        {
            tracing::debug!(index, "stopped monitoring bridge subnet");
        }
    }

    pub fn clear_vlan_subnets(&self) {
        let mut subnets = self.lock_subnets();
        for slot in subnets.iter_mut().take(MAX_VLAN_INTERFACES) {
            *slot = None;
        }
    }

    pub fn is_monitored(&self, index: usize) -> bool {
        self.lock_subnets().get(index).is_some_and(|s| s.is_some())
    }

    pub fn subnet_state(&self, index: usize) -> Option<SubnetState> {
        self.lock_subnets().get(index).and_then(|s| s.as_ref().map(|s| s.state))
    }

    /// Stops `monitor()`. Safe to call more than once.
    pub fn close(&self) {
        let tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if tx.is_some() {
            self.lock_subnets().iter_mut().for_each(|s| *s = None);
            tracing::debug!("route monitor closed");
        }
    }

    /// Runs until `close()`. Scans on debounced route change events and periodically.
    pub async fn monitor(&self) -> Result<(), BridgeError> {
        let mut stop = self.stop_rx.clone();
        if self.is_closed() {
            return Ok(());
        }

        let mut events = match self.source.subscribe() {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!(error = %e, "route change events unavailable, rescanning periodically");
                None
            }
        };

        let mut rescan = tokio::time::interval(self.rescan);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rescan.tick().await;

        let mut deadline: Option<Instant> = None;
        loop {
            let pending_deadline = deadline;
            let debounce = async move {
                match pending_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => pending().await,
                }
            };

            let wake = tokio::select! {
                _ = stop.changed() => return Ok(()),
                ev = next_event(&mut events) => Wake::Event(ev.is_some()),
                _ = debounce => Wake::Scan,
                _ = rescan.tick() => Wake::Scan,
            };

            match wake {
                Wake::Event(true) => deadline = Some(Instant::now() + DEBOUNCE),
                Wake::Event(false) => {
                    tracing::warn!("route change events ended, rescanning periodically");
                    events = None;
                }
                Wake::Scan => {
                    deadline = None;
                    self.scan().await;
                }
            }
        }
    }

    async fn scan(&self) {
        if let Err(e) = self.check_renew().await {
            tracing::warn!(error = %e, "route check failed");
        }
    }

    /// Takes one routing table snapshot and renews every subnet that needs it.
    /// Returns the number of renewals attempted.
    pub async fn check_renew(&self) -> Result<usize, BridgeError> {
        let mut limiter = self.limiter.lock().await;
        let table = self.source.routing_table()?;

        let mut jobs = Vec::new();
        {
            let mut have_token = false;
            let mut subnets = self.lock_subnets();
            for (index, slot) in subnets.iter_mut().enumerate() {
                let Some(subnet) = slot else { continue };
                let (v4, v6) = table.conflicts(subnet.ip4, subnet.ip6);
                if subnet.needs_renew(v4, v6) {
                    if !have_token && !limiter.try_take() {
                        tracing::warn!(index, ip4 = ?subnet.ip4, ip6 = ?subnet.ip6, "giving up on bridge: rate limit exceeded");
                        break;
                    }
                    have_token = true;
                    tracing::info!(index, ip4 = ?subnet.ip4, ip6 = ?subnet.ip6, v4, v6, "renewing bridge");
                    subnet.retry = false;
                    jobs.push(Job {
                        index,
                        generation: subnet.generation,
                        renew: subnet.renew.clone(),
                    });
                }
                subnet.last_v4 = v4;
                subnet.last_v6 = v6;
            }
        }

        let count = jobs.len();
        let mut set = JoinSet::new();
        for job in jobs {
            set.spawn_blocking(move || (job.index, job.generation, (job.renew)()));
        }

        while let Some(res) = set.join_next().await {
            let (index, generation, result) = match res {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "bridge renewal task failed");
                    continue;
                }
            };
            match result {
                Ok(()) => tracing::debug!(index, "bridge renewed"),
                Err(e) => {
                    tracing::warn!(index, error = %e, "failed to renew bridge, will retry");
                    let mut subnets = self.lock_subnets();
                    if let Some(subnet) = subnets[index].as_mut()
                        && subnet.generation == generation
                    {
                        subnet.retry = true;
                    }
                }
            }
        }

        Ok(count)
    }
}

impl Drop for RouteMon {
    fn drop(&mut self) {
        self.close();
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<RouteChange>>) -> Option<RouteChange> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{RouteEntry, RouteFlags};
    use crate::testing::FakeRouteSource;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn p4() -> Ipv4Prefix {
        "192.168.215.0/24".parse().unwrap()
    }

    fn p6() -> Ipv6Prefix {
        "fd07:b51a:cc66:1::/64".parse().unwrap()
    }

    fn conflict_v4() -> RouteTable {
        RouteTable::new(vec![RouteEntry::new(p4().into(), "utun4", RouteFlags::empty())])
    }

    fn counter() -> (Arc<AtomicUsize>, RenewFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let f: RenewFn = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, f)
    }

    #[tokio::test]
    async fn test_active_subnet_renews_on_new_conflict_only() {
        let source = Arc::new(FakeRouteSource::new());
        let mon = RouteMon::new(source.clone());
        let (count, renew) = counter();
        mon.set_subnet(0, Some(p4()), Some(p6()), SubnetState::Active, renew).unwrap();

        assert_eq!(mon.check_renew().await.unwrap(), 0);
        source.set_table(conflict_v4());
        assert_eq!(mon.check_renew().await.unwrap(), 1);
        // Same conflict again is not new.
        assert_eq!(mon.check_renew().await.unwrap(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_subnet_renews_when_clear() {
        let source = Arc::new(FakeRouteSource::new());
        source.set_table(conflict_v4());
        let mon = RouteMon::new(source.clone());
        let (count, renew) = counter();
        mon.set_subnet(INDEX_SCON_MACHINE, Some(p4()), None, SubnetState::Pending, renew).unwrap();

        mon.check_renew().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        source.set_table(RouteTable::default());
        mon.check_renew().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degraded_subnet_rechecks_v4() {
        let source = Arc::new(FakeRouteSource::new());
        source.set_table(conflict_v4());
        let mon = RouteMon::new(source.clone());
        let (count, renew) = counter();
        mon.set_subnet(INDEX_SCON_MACHINE, Some(p4()), Some(p6()), SubnetState::DegradedV4, renew)
            .unwrap();

        mon.check_renew().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        source.set_table(RouteTable::default());
        mon.check_renew().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewals_are_rate_limited() {
        let source = Arc::new(FakeRouteSource::new());
        let mon = RouteMon::new(source.clone());
        let (count, renew) = counter();
        mon.set_subnet(1, Some(p4()), None, SubnetState::Active, renew).unwrap();

        for _ in 0..50 {
            source.set_table(conflict_v4());
            mon.check_renew().await.unwrap();
            source.set_table(RouteTable::default());
            mon.check_renew().await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), RENEW_LIMIT);

        tokio::time::advance(RENEW_WINDOW).await;
        source.set_table(conflict_v4());
        mon.check_renew().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), RENEW_LIMIT + 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_is_retried() {
        let source = Arc::new(FakeRouteSource::new());
        let mon = RouteMon::new(source.clone());
        let attempts = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let (a, f) = (attempts.clone(), fail.clone());
        let renew: RenewFn = Arc::new(move || {
            a.fetch_add(1, Ordering::SeqCst);
            if f.load(Ordering::SeqCst) {
                Err(BridgeError::Native("busy".to_string()))
            } else {
                Ok(())
            }
        });
        mon.set_subnet(2, Some(p4()), None, SubnetState::Active, renew).unwrap();

        source.set_table(conflict_v4());
        mon.check_renew().await.unwrap();
        fail.store(false, Ordering::SeqCst);
        mon.check_renew().await.unwrap();
        mon.check_renew().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_and_close() {
        let mon = RouteMon::new(Arc::new(FakeRouteSource::new()));
        let (_, renew) = counter();
        mon.set_subnet(0, Some(p4()), None, SubnetState::Active, renew.clone()).unwrap();
        mon.set_subnet(INDEX_SCON_MACHINE, Some(p4()), None, SubnetState::Active, renew.clone())
            .unwrap();
        assert!(mon.set_subnet(NUM_SLOTS, None, None, SubnetState::Active, renew.clone()).is_err());

        mon.clear_vlan_subnets();
        assert!(!mon.is_monitored(0));
        assert!(mon.is_monitored(INDEX_SCON_MACHINE));

        mon.close();
        mon.close();
        assert!(!mon.is_monitored(INDEX_SCON_MACHINE));
        assert!(matches!(
            mon.set_subnet(0, None, None, SubnetState::Active, renew),
            Err(BridgeError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_debounces_events_and_stops_on_close() {
        let source = Arc::new(FakeRouteSource::new());
        let mon = Arc::new(RouteMon::new(source.clone()));
        let (count, renew) = counter();
        mon.set_subnet(0, Some(p4()), None, SubnetState::Active, renew).unwrap();

        let task = tokio::spawn({
            let mon = mon.clone();
            async move { mon.monitor().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        source.set_table(conflict_v4());
        for _ in 0..5 {
            source.notify();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        mon.close();
        task.await.unwrap().unwrap();
    }
}
