//! Topology discovery walk.
//!
//! A rescan starts at the server's own LLDP agent and recurses through every
//! switch found, writing device rows and switch-port edges to the store.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use walt_common::{Device, DeviceType, MacAddress, Store, TopologyEdge};

use crate::classify::DeviceClassifier;
use crate::discovery::{DiscoveryHost, DiscoveryOutcome, NeighborDiscovery};
use crate::error::{Result, TopologyError};
use crate::render::{TopologySnapshot, TreeLines};

/// Display name of the server device
pub const SERVER_NAME: &str = "walt-server";

/// Observation of a device during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub mac: MacAddress,
    pub device_type: DeviceType,
    /// Management address; `None` keeps the stored one
    pub ip: Option<IpAddr>,
    /// Switch and port the device was seen on
    pub switch: Option<(MacAddress, u32)>,
}

/// Summary of a completed rescan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanReport {
    pub switches_visited: usize,
    pub devices_seen: usize,
    pub retries: usize,
    pub edges_pruned: usize,
}

/// State of one discovery walk.
#[derive(Debug, Default)]
pub struct Walk {
    /// Switches already queried in this walk
    pub processed_switches: HashSet<MacAddress>,
    /// Devices observed, including the server
    seen: HashSet<MacAddress>,
    /// Devices whose edge was (re)written
    connected: HashSet<MacAddress>,
    switches_visited: usize,
    retries: usize,
}

/// Synthesized display name of a newly discovered device.
pub fn device_name(device_type: &DeviceType, mac: MacAddress) -> String {
    match device_type {
        DeviceType::Server => SERVER_NAME.to_string(),
        other => format!("{}-{}", other.label(), mac.suffix()),
    }
}

/// Discovers the fabric and keeps the device and topology tables current.
pub struct TopologyTracker {
    store: Arc<dyn Store>,
    discovery: Arc<dyn NeighborDiscovery>,
    classifier: DeviceClassifier,
    retry_delay: Duration,
    progress: Option<mpsc::UnboundedSender<String>>,
}

impl TopologyTracker {
    pub fn new(
        store: Arc<dyn Store>,
        discovery: Arc<dyn NeighborDiscovery>,
        classifier: DeviceClassifier,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            discovery,
            classifier,
            retry_delay,
            progress: None,
        }
    }

    /// Send a line per progress event to `progress`.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<String>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report(&self, line: String) {
        info!("{line}");
        if let Some(progress) = &self.progress {
            // a dropped receiver only stops progress output
            let _ = progress.send(line);
        }
    }

    /// Rediscover the whole fabric.
    ///
    /// Edges of devices not reconnected during the walk are deleted once the
    /// walk completes. A failing walk returns early and leaves them in place.
    #[instrument(skip(self))]
    pub async fn rescan(&self) -> Result<RescanReport> {
        self.report("Scanning network topology...".to_string());

        let devices = self.store.mark_all_unreachable().await?;
        debug!(devices, "Marked devices unreachable");

        let server_mac = self.classifier.server_mac();
        self.add_device(DeviceUpdate {
            mac: server_mac,
            device_type: DeviceType::Server,
            ip: None,
            switch: None,
        })
        .await?;

        let mut walk = Walk::default();
        walk.seen.insert(server_mac);
        self.collect_connected_devices(DiscoveryHost::Local, false, server_mac, &mut walk)
            .await?;

        let mut edges_pruned = 0;
        for edge in self.store.edges().await? {
            if !walk.connected.contains(&edge.mac) && self.store.delete_edge(edge.mac).await? {
                debug!(mac = %edge.mac, "Pruned stale edge");
                edges_pruned += 1;
            }
        }

        let report = RescanReport {
            switches_visited: walk.switches_visited,
            devices_seen: walk.seen.len(),
            retries: walk.retries,
            edges_pruned,
        };
        self.report(format!(
            "Done: {} switches, {} devices, {} retries, {} stale connections removed",
            report.switches_visited, report.devices_seen, report.retries, report.edges_pruned
        ));
        Ok(report)
    }

    /// Query `host` and record its neighbours, recursing into switches.
    ///
    /// Switches already in `walk.processed_switches` are neither queried
    /// again nor given an edge towards a downstream switch, which keeps
    /// the walk finite when discovery reports cycles.
    pub fn collect_connected_devices<'a>(
        &'a self,
        host: DiscoveryHost,
        host_is_a_switch: bool,
        host_mac: MacAddress,
        walk: &'a mut Walk,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if host_is_a_switch {
                if !walk.processed_switches.insert(host_mac) {
                    return Ok(());
                }
                walk.switches_visited += 1;
                self.report(format!("Querying {host} ({host_mac})..."));
            }

            let neighbors = loop {
                match self.discovery.query(host).await {
                    DiscoveryOutcome::Ready(neighbors) => break neighbors,
                    DiscoveryOutcome::NeedsRetry { reason } => {
                        walk.retries += 1;
                        self.report(format!("{host}: {reason}, retrying"));
                        self.discovery.refresh().await;
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    DiscoveryOutcome::Fatal { reason } => {
                        return Err(TopologyError::Discovery {
                            host: host.to_string(),
                            reason,
                        });
                    }
                }
            };

            let mut sub_switches = Vec::new();
            for (port, neighbor) in neighbors {
                let device_type = self.classifier.classify(neighbor.mac);
                if device_type.is_switch() && walk.processed_switches.contains(&neighbor.mac) {
                    // upstream switch, or a cycle back to one
                    continue;
                }

                let switch = host_is_a_switch.then_some((host_mac, port));
                self.add_device(DeviceUpdate {
                    mac: neighbor.mac,
                    device_type: device_type.clone(),
                    ip: neighbor.ip,
                    switch,
                })
                .await?;
                walk.seen.insert(neighbor.mac);
                if switch.is_some() {
                    walk.connected.insert(neighbor.mac);
                }

                if device_type.is_switch() {
                    sub_switches.push((neighbor.mac, neighbor.ip));
                }
            }

            for (mac, ip) in sub_switches {
                match ip {
                    Some(ip) => {
                        self.collect_connected_devices(DiscoveryHost::Switch { ip }, true, mac, walk)
                            .await?;
                    }
                    None => {
                        warn!(%mac, "Switch advertises no management address");
                        self.report(format!("Switch {mac} has no IP address, not exploring it"));
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Insert or refresh a device and its connection.
    pub async fn add_device(&self, update: DeviceUpdate) -> Result<Device> {
        let existing = self.store.device(update.mac).await?;
        let (name, stored_ip) = match existing {
            Some(device) => (device.name, device.ip),
            None => (device_name(&update.device_type, update.mac), None),
        };
        let device = Device {
            mac: update.mac,
            name,
            device_type: update.device_type,
            ip: update.ip.or(stored_ip),
            reachable: true,
        };
        self.store.upsert_device(&device).await?;

        if let Some((switch_mac, switch_port)) = update.switch {
            let edge = TopologyEdge {
                mac: device.mac,
                switch_mac,
                switch_port,
            };
            if self.store.edge(device.mac).await? != Some(edge) {
                self.store.delete_edge(device.mac).await?;
                if let Some(evicted) = self.store.delete_edge_at(switch_mac, switch_port).await? {
                    debug!(%evicted, %switch_mac, switch_port, "Evicted previous port owner");
                }
                self.store.insert_edge(&edge).await?;
            }
        }
        Ok(device)
    }

    async fn snapshot(&self) -> Result<TopologySnapshot> {
        Ok(TopologySnapshot::new(
            self.store.devices().await?,
            self.store.edges().await?,
        ))
    }

    /// Lines of the topology tree.
    pub async fn tree(&self) -> Result<TreeLines> {
        Ok(self.snapshot().await?.into_tree())
    }

    /// Connected and replaced device tables.
    pub async fn show(&self) -> Result<String> {
        Ok(self.snapshot().await?.show())
    }
}
