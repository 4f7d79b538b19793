/**
 * TOPOLOGY STORE - Single writer of switch, host and link records
 *
 * ROLE:
 * Owns the live network graph. Discovery feeds mutations in; everybody else
 * reads immutable, epoch-stamped snapshots.
 *
 * OPERATION:
 * - every mutation runs under one writer lock against a copy of the current
 *   snapshot; an effective change bumps the epoch and publishes the copy
 * - a mutation that changes nothing keeps the epoch and publishes nothing
 * - removing a switch or port removes its links in the same step, so a
 *   published snapshot never holds a dangling link
 * - subscribers follow the latest snapshot through a `watch` channel and get
 *   per-change detail on the event bus
 */

use crate::error::TopologyError;
use crate::events::{ControllerEvent, EventBus};
use crate::models::{Dpid, Endpoint, Epoch, Host, Link, LinkCapacities, LinkId, MacAddr, PortNo, Switch, SwitchState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// The whole graph at one epoch. Never mutated once published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    pub epoch: Epoch,
    pub switches: BTreeMap<Dpid, Switch>,
    pub hosts: BTreeMap<MacAddr, Host>,
    pub links: BTreeMap<LinkId, Link>,
}

impl TopologySnapshot {
    pub fn connected_switches(&self) -> BTreeSet<Dpid> {
        self.switches.values().filter(|s| s.is_connected()).map(|s| s.dpid).collect()
    }

    pub fn is_connected(&self, dpid: Dpid) -> bool {
        self.switches.get(&dpid).map(Switch::is_connected).unwrap_or(false)
    }

    /// Link plugged into this exact port, if any.
    pub fn link_at(&self, endpoint: Endpoint) -> Option<&Link> {
        self.links.values().find(|l| l.id.uses(endpoint))
    }

    /// Lowest-id link joining two switches.
    pub fn link_between(&self, u: Dpid, v: Dpid) -> Option<&Link> {
        self.links.values().find(|l| l.id.joins(u, v))
    }

    pub fn view(&self) -> TopologyView {
        TopologyView {
            epoch: self.epoch,
            switches: self.switches.values().cloned().collect(),
            links: self.links.values().cloned().collect(),
            hosts: self.hosts.values().cloned().collect(),
        }
    }
}

/// JSON shape of a snapshot for the API.
#[derive(Debug, Serialize)]
pub struct TopologyView {
    pub epoch: Epoch,
    pub switches: Vec<Switch>,
    pub links: Vec<Link>,
    pub hosts: Vec<Host>,
}

/// Result of a mutation: the epoch now current, and whether it moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub epoch: Epoch,
    pub changed: bool,
}

enum Change {
    SwitchEnter(Dpid),
    SwitchLeave(Dpid),
    LinkAdd(LinkId, f64),
    LinkDelete(LinkId),
    HostAdd(Host),
    HostDelete(MacAddr),
    PortStatus(Dpid, PortNo, bool),
}

#[derive(Default)]
struct Txn {
    changed: bool,
    changes: Vec<Change>,
}

impl Txn {
    fn emit(&mut self, change: Change) {
        self.changed = true;
        self.changes.push(change);
    }
}

pub struct TopologyStore {
    writer: Mutex<Arc<TopologySnapshot>>,
    tx: watch::Sender<Arc<TopologySnapshot>>,
    capacities: LinkCapacities,
    events: EventBus,
}

impl TopologyStore {
    pub fn new(capacities: LinkCapacities, events: EventBus) -> Self {
        let initial = Arc::new(TopologySnapshot::default());
        let (tx, _) = watch::channel(initial.clone());
        Self { writer: Mutex::new(initial), tx, capacities, events }
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.tx.borrow().clone()
    }

    pub fn epoch(&self) -> Epoch {
        self.tx.borrow().epoch
    }

    /// Latest snapshot, updated after every effective mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.tx.subscribe()
    }

    pub fn apply_switch_connect(&self, dpid: Dpid, ports: impl IntoIterator<Item = PortNo>) -> Applied {
        let ports: BTreeSet<PortNo> = ports.into_iter().collect();
        let result = self.mutate(|g, txn| {
            match g.switches.get_mut(&dpid) {
                Some(sw) if sw.is_connected() => {
                    if sw.ports == ports {
                        return Ok(());
                    }
                    sw.ports = ports.clone();
                    txn.changed = true;
                    drop_links_off_ports(g, dpid, txn);
                }
                Some(sw) => {
                    sw.state = SwitchState::Connected;
                    sw.ports = ports.clone();
                    sw.session += 1;
                    txn.emit(Change::SwitchEnter(dpid));
                }
                None => {
                    g.switches.insert(dpid, Switch { dpid, ports: ports.clone(), state: SwitchState::Connected, session: 1 });
                    txn.emit(Change::SwitchEnter(dpid));
                }
            }
            Ok(())
        });
        // Connecting a switch cannot fail.
        result.unwrap_or(Applied { epoch: self.epoch(), changed: false })
    }

    /// Marks the switch down and drops every link it had. Hosts stay
    /// attached; paths to them become unreachable until it comes back.
    pub fn apply_switch_disconnect(&self, dpid: Dpid) -> Result<Applied, TopologyError> {
        self.mutate(|g, txn| {
            let sw = g.switches.get_mut(&dpid).ok_or(TopologyError::UnknownSwitch(dpid))?;
            if !sw.is_connected() {
                return Ok(());
            }
            sw.state = SwitchState::Disconnected;
            sw.ports.clear();
            remove_links_where(g, txn, |id| id.touches(dpid));
            txn.emit(Change::SwitchLeave(dpid));
            Ok(())
        })
    }

    /// Adds the undirected link. A port carries at most one link, so an
    /// older link on either port is replaced. Hosts learned on either port
    /// before it turned out to be an inter-switch port are forgotten.
    pub fn apply_link_up(&self, a: Endpoint, b: Endpoint) -> Result<Applied, TopologyError> {
        let id = LinkId::new(a, b);
        let bandwidth_mbps = self.capacities.lookup(a.dpid, b.dpid);
        self.mutate(|g, txn| {
            if a.dpid == b.dpid {
                return Err(TopologyError::SelfLoop(id));
            }
            for end in [a, b] {
                let sw = g.switches.get(&end.dpid).ok_or(TopologyError::UnknownSwitch(end.dpid))?;
                if !sw.is_connected() {
                    return Err(TopologyError::SwitchDisconnected(end.dpid));
                }
            }
            if g.links.contains_key(&id) {
                return Ok(());
            }
            remove_links_where(g, txn, |other| other.uses(a) || other.uses(b));
            for end in [a, b] {
                if let Some(sw) = g.switches.get_mut(&end.dpid) {
                    sw.ports.insert(end.port);
                }
            }
            g.links.insert(id, Link { id, bandwidth_mbps });
            txn.emit(Change::LinkAdd(id, bandwidth_mbps));
            let misplaced: Vec<MacAddr> =
                g.hosts.values().filter(|h| h.attachment == a || h.attachment == b).map(|h| h.mac).collect();
            for mac in misplaced {
                g.hosts.remove(&mac);
                txn.emit(Change::HostDelete(mac));
            }
            Ok(())
        })
    }

    pub fn apply_link_down(&self, a: Endpoint, b: Endpoint) -> Result<Applied, TopologyError> {
        let id = LinkId::new(a, b);
        self.mutate(|g, txn| {
            if g.links.remove(&id).is_some() {
                txn.emit(Change::LinkDelete(id));
            }
            Ok(())
        })
    }

    /// Learns or moves a host. Observations on inter-switch ports are
    /// ignored, and a missing IP never erases a known one.
    pub fn apply_host_seen(
        &self,
        mac: MacAddr,
        dpid: Dpid,
        port: PortNo,
        ip: Option<Ipv4Addr>,
    ) -> Result<Applied, TopologyError> {
        let attachment = Endpoint { dpid, port };
        self.mutate(|g, txn| {
            let sw = g.switches.get(&dpid).ok_or(TopologyError::UnknownSwitch(dpid))?;
            if !sw.is_connected() {
                return Err(TopologyError::SwitchDisconnected(dpid));
            }
            if g.link_at(attachment).is_some() {
                debug!(%mac, %attachment, "host seen on link port, ignored");
                return Ok(());
            }
            let ip = ip.or_else(|| g.hosts.get(&mac).and_then(|h| h.ip));
            let host = Host { mac, ip, attachment };
            if g.hosts.get(&mac) == Some(&host) {
                return Ok(());
            }
            if let Some(sw) = g.switches.get_mut(&dpid) {
                sw.ports.insert(port);
            }
            g.hosts.insert(mac, host.clone());
            txn.emit(Change::HostAdd(host));
            Ok(())
        })
    }

    /// Port up adds it to the active set; port down also drops its link.
    pub fn apply_port_status(&self, dpid: Dpid, port: PortNo, up: bool) -> Result<Applied, TopologyError> {
        self.mutate(|g, txn| {
            let sw = g.switches.get_mut(&dpid).ok_or(TopologyError::UnknownSwitch(dpid))?;
            if !sw.is_connected() {
                return Err(TopologyError::SwitchDisconnected(dpid));
            }
            let flipped = if up { sw.ports.insert(port) } else { sw.ports.remove(&port) };
            if !up {
                let endpoint = Endpoint { dpid, port };
                remove_links_where(g, txn, |id| id.uses(endpoint));
            }
            if flipped {
                txn.emit(Change::PortStatus(dpid, port, up));
            }
            Ok(())
        })
    }

    fn mutate<F>(&self, f: F) -> Result<Applied, TopologyError>
    where
        F: FnOnce(&mut TopologySnapshot, &mut Txn) -> Result<(), TopologyError>,
    {
        let mut current = self.writer.lock();
        let mut next = (**current).clone();
        let mut txn = Txn::default();
        f(&mut next, &mut txn)?;
        if !txn.changed {
            return Ok(Applied { epoch: current.epoch, changed: false });
        }

        next.epoch = current.epoch.next();
        let epoch = next.epoch;
        let next = Arc::new(next);
        *current = next.clone();
        self.tx.send_replace(next);

        for change in txn.changes {
            self.events.publish(self.describe(change, epoch));
        }
        self.events.publish(ControllerEvent::TopologyChanged { epoch });
        Ok(Applied { epoch, changed: true })
    }

    fn describe(&self, change: Change, epoch: Epoch) -> ControllerEvent {
        match change {
            Change::SwitchEnter(dpid) => {
                info!(%dpid, %epoch, "switch connected");
                ControllerEvent::SwitchEnter { dpid, epoch }
            }
            Change::SwitchLeave(dpid) => {
                info!(%dpid, %epoch, "switch disconnected");
                ControllerEvent::SwitchLeave { dpid, epoch }
            }
            Change::LinkAdd(link, bandwidth_mbps) => {
                info!(%link, bandwidth_mbps, %epoch, "link up");
                ControllerEvent::LinkAdd { link, bandwidth_mbps, epoch }
            }
            Change::LinkDelete(link) => {
                info!(%link, %epoch, "link down");
                ControllerEvent::LinkDelete { link, epoch }
            }
            Change::HostAdd(host) => {
                info!(mac = %host.mac, at = %host.attachment, %epoch, "host learned");
                ControllerEvent::HostAdd {
                    mac: host.mac,
                    ip: host.ip,
                    dpid: host.attachment.dpid,
                    port: host.attachment.port,
                    epoch,
                }
            }
            Change::HostDelete(mac) => {
                info!(%mac, %epoch, "host dropped from inter-switch port");
                ControllerEvent::HostDelete { mac, epoch }
            }
            Change::PortStatus(dpid, port, up) => {
                info!(%dpid, %port, up, %epoch, "port status");
                ControllerEvent::PortStatus { dpid, port, up, epoch }
            }
        }
    }
}

fn remove_links_where(g: &mut TopologySnapshot, txn: &mut Txn, pred: impl Fn(&LinkId) -> bool) {
    let doomed: Vec<LinkId> = g.links.keys().filter(|id| pred(id)).copied().collect();
    for id in doomed {
        g.links.remove(&id);
        txn.emit(Change::LinkDelete(id));
    }
}

fn drop_links_off_ports(g: &mut TopologySnapshot, dpid: Dpid, txn: &mut Txn) {
    let active = match g.switches.get(&dpid) {
        Some(sw) => sw.ports.clone(),
        None => return,
    };
    remove_links_where(g, txn, |id| {
        [id.a, id.b].iter().any(|end| end.dpid == dpid && !active.contains(&end.port))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TopologyStore {
        TopologyStore::new(LinkCapacities::new(10.0).with(1, 3, 40.0), EventBus::new(64))
    }

    fn ports(n: u32) -> Vec<PortNo> {
        (1..=n).map(PortNo).collect()
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr([0, 0, 0, 0, 0, last])
    }

    #[test]
    fn epochs_increase_only_on_effective_change() {
        let s = store();
        let e1 = s.apply_switch_connect(Dpid(1), ports(3));
        assert!(e1.changed);
        assert_eq!(e1.epoch, Epoch(1));
        let again = s.apply_switch_connect(Dpid(1), ports(3));
        assert!(!again.changed);
        assert_eq!(again.epoch, Epoch(1));

        s.apply_switch_connect(Dpid(2), ports(3));
        let up = s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        assert_eq!(up.epoch, Epoch(3));
        let dup = s.apply_link_up(Endpoint::new(2, 2), Endpoint::new(1, 2)).unwrap();
        assert!(!dup.changed);
        assert_eq!(s.snapshot().links.len(), 1);
    }

    #[test]
    fn equal_epochs_mean_equal_snapshots() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(2));
        let a = s.snapshot();
        let _ = s.apply_link_down(Endpoint::new(1, 1), Endpoint::new(9, 1));
        let b = s.snapshot();
        assert_eq!(a.epoch, b.epoch);
        assert_eq!(*a, *b);
    }

    #[test]
    fn link_up_requires_live_switches() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(2));
        let err = s.apply_link_up(Endpoint::new(1, 1), Endpoint::new(2, 1)).unwrap_err();
        assert_eq!(err, TopologyError::UnknownSwitch(Dpid(2)));

        s.apply_switch_connect(Dpid(2), ports(2));
        s.apply_switch_disconnect(Dpid(2)).unwrap();
        let err = s.apply_link_up(Endpoint::new(1, 1), Endpoint::new(2, 1)).unwrap_err();
        assert_eq!(err, TopologyError::SwitchDisconnected(Dpid(2)));

        let err = s.apply_link_up(Endpoint::new(1, 1), Endpoint::new(1, 2)).unwrap_err();
        assert!(matches!(err, TopologyError::SelfLoop(_)));
    }

    #[test]
    fn disconnect_removes_links_but_keeps_hosts() {
        let s = store();
        for d in 1..=3 {
            s.apply_switch_connect(Dpid(d), ports(3));
        }
        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        s.apply_link_up(Endpoint::new(2, 3), Endpoint::new(3, 2)).unwrap();
        s.apply_host_seen(mac(2), Dpid(2), PortNo(1), None).unwrap();

        s.apply_switch_disconnect(Dpid(2)).unwrap();
        let snap = s.snapshot();
        assert!(snap.links.is_empty());
        assert!(!snap.is_connected(Dpid(2)));
        assert!(snap.hosts.contains_key(&mac(2)));
        assert!(snap.links.values().all(|l| snap.is_connected(l.id.a.dpid) && snap.is_connected(l.id.b.dpid)));
    }

    #[test]
    fn new_link_on_a_port_replaces_the_old_one() {
        let s = store();
        for d in 1..=3 {
            s.apply_switch_connect(Dpid(d), ports(3));
        }
        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(3, 2)).unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.links.len(), 1);
        let link = snap.link_between(Dpid(1), Dpid(3)).unwrap();
        assert_eq!(link.bandwidth_mbps, 40.0);
    }

    #[test]
    fn hosts_on_link_ports_are_ignored() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(3));
        s.apply_switch_connect(Dpid(2), ports(3));
        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        let before = s.epoch();
        let applied = s.apply_host_seen(mac(9), Dpid(1), PortNo(2), None).unwrap();
        assert!(!applied.changed);
        assert_eq!(s.epoch(), before);
        assert!(s.snapshot().hosts.is_empty());
    }

    #[test]
    fn link_up_evicts_hosts_on_its_ports() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(3));
        s.apply_switch_connect(Dpid(2), ports(3));
        s.apply_host_seen(mac(1), Dpid(1), PortNo(1), None).unwrap();
        s.apply_host_seen(mac(9), Dpid(1), PortNo(2), None).unwrap();
        assert_eq!(s.snapshot().hosts.len(), 2);

        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        let snap = s.snapshot();
        assert!(!snap.hosts.contains_key(&mac(9)));
        assert!(snap.hosts.contains_key(&mac(1)));
    }

    #[test]
    fn reconnect_starts_a_new_session() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(2));
        assert_eq!(s.snapshot().switches[&Dpid(1)].session, 1);
        s.apply_switch_connect(Dpid(1), ports(3));
        assert_eq!(s.snapshot().switches[&Dpid(1)].session, 1);
        s.apply_switch_disconnect(Dpid(1)).unwrap();
        s.apply_switch_connect(Dpid(1), ports(3));
        assert_eq!(s.snapshot().switches[&Dpid(1)].session, 2);
    }

    #[test]
    fn host_ip_is_sticky() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(3));
        let ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        s.apply_host_seen(mac(1), Dpid(1), PortNo(1), Some(ip)).unwrap();
        let again = s.apply_host_seen(mac(1), Dpid(1), PortNo(1), None).unwrap();
        assert!(!again.changed);
        assert_eq!(s.snapshot().hosts[&mac(1)].ip, Some(ip));
    }

    #[test]
    fn port_down_drops_its_link() {
        let s = store();
        s.apply_switch_connect(Dpid(1), ports(3));
        s.apply_switch_connect(Dpid(2), ports(3));
        s.apply_link_up(Endpoint::new(1, 2), Endpoint::new(2, 2)).unwrap();
        let applied = s.apply_port_status(Dpid(2), PortNo(2), false).unwrap();
        assert!(applied.changed);
        let snap = s.snapshot();
        assert!(snap.links.is_empty());
        assert!(!snap.switches[&Dpid(2)].ports.contains(&PortNo(2)));
    }

    #[tokio::test]
    async fn subscribers_and_bus_see_each_change() {
        let bus = EventBus::new(64);
        let s = TopologyStore::new(LinkCapacities::default(), bus.clone());
        let mut rx = s.subscribe();
        let mut events = bus.subscribe();

        s.apply_switch_connect(Dpid(7), ports(1));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().epoch, Epoch(1));
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::SwitchEnter { dpid: Dpid(7), epoch: Epoch(1) });
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::TopologyChanged { epoch: Epoch(1) });
    }
}
