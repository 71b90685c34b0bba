//! Host-visible bridges for the machine network and per-container VLANs.
//!
//! All bridge state sits behind one lock that is held across native calls. The route
//! monitor never takes it; renew callbacks take it themselves through a weak reference,
//! so a late renewal after shutdown is a no-op.

use crate::error::NetError;
use crate::netconf::{
    GUEST_MAC_SCON_BRIDGE, HOST_MAC_SCON_BRIDGE, MACHINE_BRIDGE_UUID, NAT64_PREFIX_V6, SCON_HOST_BRIDGE_IP4,
    SCON_HOST_BRIDGE_IP6, SCON_SUBNET4_PREFIX, SCON_SUBNET6_PREFIX, VLAN_ROUTER_MAC_TEMPLATE,
};
use ross_bridge::{
    BridgeError, BridgeHandle, BridgeNetworkConfig, DockerBridgeConfig, INDEX_SCON_MACHINE, MAX_VLAN_INTERFACES,
    NativeBridge, RenewFn, RouteMon, RouterHandle, SubnetState, VlanRouterConfig,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

/// Slot of the machine bridge's guest fd.
pub const SLOT_MACHINE: usize = 0;
/// Slot of the VLAN router's guest fd.
pub const SLOT_VLAN_ROUTER: usize = 1;

#[derive(Default)]
struct BridgeState {
    fds: Vec<OwnedFd>,
    bridges: Vec<Option<BridgeHandle>>,
    vlan_router: Option<RouterHandle>,
    vlan_indices: HashMap<DockerBridgeConfig, usize>,
    /// Set when the machine subnet's IPv4 side was claimed by another route at creation.
    disable_machine_v4: bool,
    enabled: bool,
    closed: bool,
}

impl BridgeState {
    fn fd(&self, slot: usize) -> Result<RawFd, NetError> {
        self.fds
            .get(slot)
            .map(|fd| fd.as_raw_fd())
            .ok_or(NetError::BridgeNotFound)
    }
}

struct Shared {
    state: Mutex<BridgeState>,
    native: Arc<dyn NativeBridge>,
    route_mon: Arc<RouteMon>,
    link_mtu: u32,
}

/// Machine bridge and VLAN router management.
pub struct HostBridges {
    shared: Arc<Shared>,
}

fn to_bridge_error(e: NetError) -> BridgeError {
    match e {
        NetError::Conflict => BridgeError::Conflict,
        NetError::Bridge(e) => e,
        NetError::Io(e) => BridgeError::Io(e),
        other => BridgeError::Native(other.to_string()),
    }
}

impl HostBridges {
    pub fn new(native: Arc<dyn NativeBridge>, route_mon: Arc<RouteMon>, link_mtu: u32, enabled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState {
                    enabled,
                    ..Default::default()
                }),
                native,
                route_mon,
                link_mtu,
            }),
        }
    }

    pub fn route_mon(&self) -> &Arc<RouteMon> {
        &self.shared.route_mon
    }

    /// Adds the next guest-side fd. The fd in [`SLOT_VLAN_ROUTER`] brings up the VLAN router.
    pub fn add_fd(&self, fd: OwnedFd) -> Result<(), NetError> {
        let mut st = self.shared.lock()?;
        let slot = st.fds.len();
        if slot == SLOT_VLAN_ROUTER {
            let config = VlanRouterConfig {
                guest_fd: fd.as_raw_fd(),
                mac_prefix: VLAN_ROUTER_MAC_TEMPLATE.prefix(),
                max_vlan_interfaces: MAX_VLAN_INTERFACES,
            };
            let router = self.shared.native.new_vlan_router(&config)?;
            st.vlan_router = Some(RouterHandle::new(router));
            st.vlan_indices.clear();
            tracing::info!(max = MAX_VLAN_INTERFACES, "VLAN router created");
        }
        st.fds.push(fd);
        st.bridges.push(None);
        Ok(())
    }

    pub fn add_vlan_bridge(&self, config: &DockerBridgeConfig) -> Result<usize, NetError> {
        self.shared.add_vlan_bridge(config)
    }

    pub fn remove_vlan_bridge(&self, config: &DockerBridgeConfig) -> Result<usize, NetError> {
        let config = config.stripped();
        let mut st = self.shared.lock()?;
        let index = *st.vlan_indices.get(&config).ok_or(NetError::BridgeNotFound)?;

        self.shared.route_mon.clear_subnet(index);
        tracing::debug!(index, ip4 = ?config.ip4_subnet, ip6 = ?config.ip6_subnet, "removing vlan bridge");
        st.vlan_router
            .as_mut()
            .ok_or(NetError::BridgeNotFound)?
            .remove_bridge(index)?;
        st.vlan_indices.remove(&config);
        Ok(index)
    }

    pub fn clear_vlan_bridges(&self, include_machine: bool) -> Result<(), NetError> {
        let mut st = self.shared.lock()?;
        self.shared.clear_vlan_bridges_locked(&mut st, include_machine)
    }

    pub fn vlan_count(&self) -> usize {
        self.shared.lock().map(|st| st.vlan_indices.len()).unwrap_or(0)
    }

    pub fn create_machine_bridge(&self) -> Result<(), NetError> {
        create_machine_bridge(&self.shared)
    }

    pub fn machine_bridge_open(&self) -> bool {
        self.shared
            .lock()
            .map(|st| st.bridges.get(SLOT_MACHINE).is_some_and(|b| b.is_some()))
            .unwrap_or(false)
    }

    pub fn machine_v4_disabled(&self) -> bool {
        self.shared.lock().map(|st| st.disable_machine_v4).unwrap_or(false)
    }

    /// Applies a change of the bridge setting. Turning bridges off tears down everything,
    /// including the machine bridge; turning them on brings the machine bridge back.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), NetError> {
        {
            let mut st = self.shared.lock()?;
            if st.enabled == enabled {
                return Ok(());
            }
            st.enabled = enabled;
            if !enabled {
                tracing::info!("Disabling host bridges");
                return self.shared.clear_vlan_bridges_locked(&mut st, true);
            }
        }
        tracing::info!("Enabling host bridges");
        self.create_machine_bridge()
    }

    /// Tears everything down: route monitor, VLAN router, bridges, then the raw fds.
    /// Idempotent.
    pub fn stop(&self) {
        let mut st = match self.shared.state.lock() {
            Ok(st) => st,
            Err(e) => e.into_inner(),
        };
        if st.closed {
            return;
        }
        st.closed = true;
        self.shared.route_mon.close();

        if let Some(mut router) = st.vlan_router.take()
            && let Err(e) = router.close()
        {
            tracing::warn!(error = %e, "failed to close vlan router");
        }
        for (slot, bridge) in st.bridges.iter_mut().enumerate() {
            if let Some(mut b) = bridge.take() {
                tracing::debug!(slot, bridge = %b.label(), "closing bridge");
                if let Err(e) = b.close() {
                    tracing::warn!(slot, error = %e, "failed to close bridge");
                }
            }
        }
        st.vlan_indices.clear();
        st.fds.clear();
    }
}

impl Drop for HostBridges {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, BridgeState>, NetError> {
        let st = self.state.lock().map_err(|_| NetError::Closed)?;
        if st.closed {
            return Err(NetError::Closed);
        }
        Ok(st)
    }

    fn add_vlan_bridge(self: &Arc<Self>, config: &DockerBridgeConfig) -> Result<usize, NetError> {
        let config = config.stripped();
        let mut st = self.lock()?;
        if st.vlan_indices.contains_key(&config) {
            return Err(NetError::BridgeExists);
        }
        if !st.enabled {
            return Err(NetError::BridgesDisabled);
        }

        let template = VLAN_ROUTER_MAC_TEMPLATE;
        let host_ip4 = config.host_ip4();
        let native_config = BridgeNetworkConfig {
            guest_fd: st.fd(SLOT_VLAN_ROUTER)?,
            guest_scon_fd: st.fd(SLOT_MACHINE)?,
            // The router reads the guest side.
            should_read_guest: false,
            uuid: config.derive_uuid(),
            ip4_address: host_ip4.map(|(ip, _)| ip),
            ip4_mask: host_ip4.map(|(_, mask)| mask),
            ip6_address: config.host_ip6(),
            // The router fills in the index.
            host_override_mac: template,
            guest_mac: template,
            ndp_reply_prefix: config.ip6_subnet,
            allow_multicast: false,
            max_link_mtu: self.link_mtu,
        };

        // A zero network makes the host install a global route for it, and an all-zero
        // v6 prefix is refused outright.
        if let Some(p4) = config.ip4_subnet
            && p4.addr().octets()[0] == 0
        {
            return Err(NetError::InvalidSubnet(format!("0.0.0.0/8 not allowed: {p4}")));
        }
        if let Some(p6) = config.ip6_subnet
            && p6.addr().is_unspecified()
        {
            return Err(NetError::InvalidSubnet(format!("'::' not allowed: {p6}")));
        }

        let table = self.route_mon.routing_table()?;
        if table.has_any_valid_routes(config.ip4_subnet, config.ip6_subnet) {
            tracing::warn!(ip4 = ?config.ip4_subnet, ip6 = ?config.ip6_subnet, "vlan bridge conflicts with existing route");
            return Err(NetError::Conflict);
        }

        tracing::debug!(uuid = %native_config.uuid, ip4 = ?native_config.ip4_address, ip6 = ?native_config.ip6_address, "adding vlan bridge");
        let router = st.vlan_router.as_mut().ok_or(NetError::BridgeNotFound)?;
        let index = router.add_bridge(&native_config)?;

        let weak = Arc::downgrade(self);
        let renew: RenewFn = Arc::new(move || renew_vlan_bridge(&weak, index));
        self.route_mon
            .set_subnet(index, config.ip4_subnet, config.ip6_subnet, SubnetState::Active, renew)?;

        tracing::info!(index, ip4 = ?config.ip4_subnet, ip6 = ?config.ip6_subnet, "VLAN bridge added");
        st.vlan_indices.insert(config, index);
        Ok(index)
    }

    fn clear_vlan_bridges_locked(&self, st: &mut BridgeState, include_machine: bool) -> Result<(), NetError> {
        // Unregister first so the monitor cannot renew what is being torn down.
        self.route_mon.clear_vlan_subnets();
        tracing::debug!(count = st.vlan_indices.len(), include_machine, "clearing vlan bridges");
        if let Some(router) = st.vlan_router.as_mut() {
            router.clear_bridges()?;
        }
        if include_machine {
            self.close_machine_bridge_locked(st)?;
        }
        st.vlan_indices.clear();
        Ok(())
    }

    fn close_machine_bridge_locked(&self, st: &mut BridgeState) -> Result<(), NetError> {
        let Some(slot) = st.bridges.get_mut(SLOT_MACHINE) else {
            return Ok(());
        };
        let Some(mut bridge) = slot.take() else {
            return Ok(());
        };
        self.route_mon.clear_subnet(INDEX_SCON_MACHINE);
        tracing::debug!("closing machine bridge");
        bridge.close()?;
        Ok(())
    }

    fn machine_config(&self, st: &BridgeState) -> Result<BridgeNetworkConfig, NetError> {
        let fd = st.fd(SLOT_MACHINE)?;
        let config = BridgeNetworkConfig {
            guest_fd: fd,
            guest_scon_fd: fd,
            should_read_guest: true,
            uuid: Uuid::parse_str(MACHINE_BRIDGE_UUID).map_err(|e| NetError::Setup(e.to_string()))?,
            ip4_address: Some(SCON_HOST_BRIDGE_IP4),
            ip4_mask: Some(SCON_SUBNET4_PREFIX.netmask()),
            ip6_address: Some(SCON_HOST_BRIDGE_IP6),
            host_override_mac: HOST_MAC_SCON_BRIDGE,
            guest_mac: GUEST_MAC_SCON_BRIDGE,
            ndp_reply_prefix: Some(NAT64_PREFIX_V6),
            allow_multicast: true,
            max_link_mtu: self.link_mtu,
        };
        Ok(if st.disable_machine_v4 {
            config.without_ip4()
        } else {
            config
        })
    }
}

/// Creates the machine bridge, or recreates it in place when it already exists.
///
/// The first creation checks the routing table: an IPv4-only conflict yields a v6-only
/// bridge, a conflict on both families fails. Either way the subnet is handed to the
/// monitor so a later route change triggers another attempt.
fn create_machine_bridge(shared: &Arc<Shared>) -> Result<(), NetError> {
    let mut st = shared.lock()?;
    if st.fds.is_empty() {
        return Err(NetError::BridgeNotFound);
    }
    let table = shared.route_mon.routing_table()?;
    let (c4, c6) = table.conflicts(Some(SCON_SUBNET4_PREFIX), Some(SCON_SUBNET6_PREFIX));

    let renewal = match st.bridges[SLOT_MACHINE].take() {
        Some(mut old) => {
            tracing::debug!("renewing machine bridge");
            if let Err(e) = old.close() {
                tracing::warn!(error = %e, "failed to close old machine bridge");
            }
            true
        }
        None => false,
    };

    let mut state = SubnetState::Active;
    let mut register = !renewal;
    if renewal {
        if st.disable_machine_v4 && !c4 {
            tracing::info!("machine subnet IPv4 is free again, restoring it");
            st.disable_machine_v4 = false;
            register = true;
        }
    } else if c6 {
        tracing::warn!(v4 = c4, "machine bridge conflicts with existing route");
        register_machine(shared, SubnetState::Pending)?;
        return Err(NetError::Conflict);
    } else if c4 {
        tracing::warn!("machine bridge IPv4 conflicts with existing route, continuing with IPv6 only");
        st.disable_machine_v4 = true;
    }
    if st.disable_machine_v4 {
        state = SubnetState::DegradedV4;
    }

    let config = shared.machine_config(&st)?;
    let created = shared.native.new_bridge(&config);
    if register {
        let state = if created.is_ok() { state } else { SubnetState::Pending };
        register_machine(shared, state)?;
    }
    let bridge = created?;
    st.bridges[SLOT_MACHINE] = Some(BridgeHandle::new(bridge, "machine"));
    tracing::info!(v4 = !st.disable_machine_v4, renewal, "Machine bridge created");
    Ok(())
}

fn register_machine(shared: &Arc<Shared>, state: SubnetState) -> Result<(), NetError> {
    let weak = Arc::downgrade(shared);
    let renew: RenewFn = Arc::new(move || match weak.upgrade() {
        Some(shared) => create_machine_bridge(&shared).map_err(to_bridge_error),
        None => Err(BridgeError::Closed),
    });
    shared.route_mon.set_subnet(
        INDEX_SCON_MACHINE,
        Some(SCON_SUBNET4_PREFIX),
        Some(SCON_SUBNET6_PREFIX),
        state,
        renew,
    )?;
    Ok(())
}

fn renew_vlan_bridge(weak: &Weak<Shared>, index: usize) -> Result<(), BridgeError> {
    let shared = weak.upgrade().ok_or(BridgeError::Closed)?;
    let mut st = shared.lock().map_err(to_bridge_error)?;
    tracing::debug!(index, "renewing vlan bridge");
    st.vlan_router
        .as_mut()
        .ok_or_else(|| BridgeError::Native("vlan router closed".to_string()))?
        .renew_bridge(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ross_bridge::testing::{FakeCounters, FakeNativeBridge, FakeRouteSource};
    use ross_bridge::{IpPrefix, Ipv4Prefix, Ipv6Prefix, RouteEntry, RouteFlags, RouteTable};
    use std::os::fd::OwnedFd;

    struct Fixture {
        native: Arc<FakeNativeBridge>,
        routes: Arc<FakeRouteSource>,
        bridges: HostBridges,
    }

    fn dgram_fd() -> OwnedFd {
        let (a, _b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        a.into()
    }

    fn fixture() -> Fixture {
        let native = Arc::new(FakeNativeBridge::new());
        let routes = Arc::new(FakeRouteSource::new());
        let mon = Arc::new(RouteMon::new(routes.clone()));
        let bridges = HostBridges::new(native.clone(), mon, 1500, true);
        bridges.add_fd(dgram_fd()).unwrap();
        bridges.add_fd(dgram_fd()).unwrap();
        Fixture { native, routes, bridges }
    }

    fn docker(v4: &str, v6: Option<&str>) -> DockerBridgeConfig {
        DockerBridgeConfig {
            ip4_subnet: Some(v4.parse().unwrap()),
            ip6_subnet: v6.map(|s| s.parse().unwrap()),
            guest_interface_name: "br-1234".to_string(),
        }
    }

    fn claimed(prefix: &str) -> RouteTable {
        let p: Ipv4Prefix = prefix.parse().unwrap();
        RouteTable::new(vec![RouteEntry::new(IpPrefix::V4(p), "utun3", RouteFlags::empty())])
    }

    #[test]
    fn test_vlan_router_created_with_second_fd() {
        let f = fixture();
        assert_eq!(FakeCounters::get(&f.native.counters.routers_created), 1);
    }

    #[test]
    fn test_vlan_add_remove_reallocates() {
        let f = fixture();
        let cfg = docker("172.17.0.0/16", Some("fd00:dead:beef::/64"));
        let index = f.bridges.add_vlan_bridge(&cfg).unwrap();
        assert!(f.bridges.route_mon().is_monitored(index));

        // The interface name does not matter for identity.
        let mut renamed = cfg.clone();
        renamed.guest_interface_name = "docker0".to_string();
        assert!(matches!(f.bridges.add_vlan_bridge(&renamed), Err(NetError::BridgeExists)));

        assert_eq!(f.bridges.remove_vlan_bridge(&renamed).unwrap(), index);
        assert!(!f.bridges.route_mon().is_monitored(index));
        assert!(matches!(f.bridges.remove_vlan_bridge(&cfg), Err(NetError::BridgeNotFound)));
        assert_eq!(f.bridges.add_vlan_bridge(&cfg).unwrap(), index);

        let created = f.native.created_configs();
        let last = created.last().unwrap();
        assert_eq!(last.host_override_mac, VLAN_ROUTER_MAC_TEMPLATE.with_index(index as u8));
        assert_eq!(last.uuid, cfg.derive_uuid());
        assert!(!last.should_read_guest);
    }

    #[test]
    fn test_vlan_conflict_rejected_without_native_call() {
        let f = fixture();
        f.routes.set_table(claimed("172.17.0.0/16"));
        let err = f.bridges.add_vlan_bridge(&docker("172.17.0.0/16", None)).unwrap_err();
        assert!(err.to_string().contains("conflict"));
        assert_eq!(FakeCounters::get(&f.native.counters.vlan_added), 0);
        assert_eq!(f.bridges.vlan_count(), 0);
        for i in 0..MAX_VLAN_INTERFACES {
            assert!(!f.bridges.route_mon().is_monitored(i));
        }
    }

    #[test]
    fn test_zero_prefixes_rejected_before_native_call() {
        let f = fixture();
        let err = f.bridges.add_vlan_bridge(&docker("0.1.0.0/16", None)).unwrap_err();
        assert!(matches!(err, NetError::InvalidSubnet(_)));

        let v6_zero = DockerBridgeConfig {
            ip4_subnet: None,
            ip6_subnet: Some(Ipv6Prefix::saturating(std::net::Ipv6Addr::UNSPECIFIED, 64)),
            guest_interface_name: String::new(),
        };
        assert!(matches!(
            f.bridges.add_vlan_bridge(&v6_zero),
            Err(NetError::InvalidSubnet(_))
        ));
        assert_eq!(FakeCounters::get(&f.native.counters.vlan_added), 0);
        assert_eq!(f.routes.reads(), 0);
    }

    #[test]
    fn test_disabled_bridges_refuse_vlans() {
        let f = fixture();
        f.bridges.set_enabled(false).unwrap();
        assert!(matches!(
            f.bridges.add_vlan_bridge(&docker("172.18.0.0/16", None)),
            Err(NetError::BridgesDisabled)
        ));
        f.bridges.set_enabled(true).unwrap();
        assert!(f.bridges.machine_bridge_open());
        assert!(f.bridges.add_vlan_bridge(&docker("172.18.0.0/16", None)).is_ok());
    }

    #[test]
    fn test_machine_bridge_degrades_to_v6_on_v4_conflict() {
        let f = fixture();
        f.routes.set_table(claimed("192.168.139.0/24"));
        f.bridges.create_machine_bridge().unwrap();
        assert!(f.bridges.machine_v4_disabled());
        assert_eq!(
            f.bridges.route_mon().subnet_state(INDEX_SCON_MACHINE),
            Some(SubnetState::DegradedV4)
        );
        let created = f.native.created_configs();
        assert!(!created[0].has_ip4());
        assert!(created[0].should_read_guest);

        // Renewal after the conflicting route went away restores IPv4.
        f.routes.set_table(RouteTable::default());
        f.bridges.create_machine_bridge().unwrap();
        assert!(!f.bridges.machine_v4_disabled());
        assert!(f.native.created_configs()[1].has_ip4());
        assert_eq!(FakeCounters::get(&f.native.counters.bridges_closed), 1);
        assert_eq!(
            f.bridges.route_mon().subnet_state(INDEX_SCON_MACHINE),
            Some(SubnetState::Active)
        );
    }

    #[test]
    fn test_machine_bridge_conflict_on_both_families_is_pending() {
        let f = fixture();
        let p4: Ipv4Prefix = "192.168.0.0/16".parse().unwrap();
        let p6: Ipv6Prefix = "fd07:b51a:cc66::/48".parse().unwrap();
        f.routes.set_table(RouteTable::new(vec![
            RouteEntry::new(IpPrefix::V4(p4), "utun3", RouteFlags::empty()),
            RouteEntry::new(IpPrefix::V6(p6), "utun3", RouteFlags::empty()),
        ]));
        let err = f.bridges.create_machine_bridge().unwrap_err();
        assert_eq!(err.to_string(), "conflict with existing route");
        assert!(!f.bridges.machine_bridge_open());
        assert_eq!(
            f.bridges.route_mon().subnet_state(INDEX_SCON_MACHINE),
            Some(SubnetState::Pending)
        );
    }

    #[test]
    fn test_clear_and_stop() {
        let f = fixture();
        f.bridges.create_machine_bridge().unwrap();
        f.bridges.add_vlan_bridge(&docker("172.19.0.0/16", None)).unwrap();

        f.bridges.clear_vlan_bridges(false).unwrap();
        assert_eq!(f.bridges.vlan_count(), 0);
        assert!(f.bridges.machine_bridge_open());

        f.bridges.stop();
        f.bridges.stop();
        assert_eq!(FakeCounters::get(&f.native.counters.routers_closed), 1);
        assert_eq!(FakeCounters::get(&f.native.counters.bridges_closed), 1);
        assert!(matches!(
            f.bridges.add_vlan_bridge(&docker("172.20.0.0/16", None)),
            Err(NetError::Closed)
        ));
    }
}
