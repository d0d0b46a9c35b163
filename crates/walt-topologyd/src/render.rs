//! Text rendering of the stored topology.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use walt_common::{Device, MacAddress, TopologyEdge};

/// Devices and edges read from the store at one point in time.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    devices: HashMap<MacAddress, Device>,
    edges: Vec<TopologyEdge>,
}

impl TopologySnapshot {
    pub fn new(devices: Vec<Device>, edges: Vec<TopologyEdge>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.mac, d)).collect(),
            edges,
        }
    }

    fn name_of(&self, mac: MacAddress) -> String {
        self.devices
            .get(&mac)
            .map_or_else(|| mac.to_string(), |d| d.name.clone())
    }

    /// Consume the snapshot into a lazy iterator of tree lines.
    pub fn into_tree(self) -> TreeLines {
        let with_edge: HashSet<MacAddress> = self.edges.iter().map(|e| e.mac).collect();

        let mut children: HashMap<MacAddress, Vec<(u32, MacAddress)>> = HashMap::new();
        for edge in &self.edges {
            children
                .entry(edge.switch_mac)
                .or_default()
                .push((edge.switch_port, edge.mac));
        }
        for list in children.values_mut() {
            list.sort();
        }

        let mut roots: Vec<&Device> = self
            .devices
            .values()
            .filter(|d| d.device_type.is_switch() && !with_edge.contains(&d.mac))
            .collect();
        roots.sort_by(|a, b| (&a.name, a.mac).cmp(&(&b.name, b.mac)));

        let stack = roots
            .iter()
            .rev()
            .map(|d| TreeEntry {
                depth: 0,
                port: None,
                mac: d.mac,
            })
            .collect();

        TreeLines {
            devices: self.devices,
            children,
            stack,
            visited: HashSet::new(),
        }
    }

    /// Render the connected and replaced device tables.
    pub fn show(&self) -> String {
        let switches: HashSet<MacAddress> = self.edges.iter().map(|e| e.switch_mac).collect();

        let mut connected: Vec<Vec<String>> = self
            .edges
            .iter()
            .filter_map(|edge| {
                let device = self.devices.get(&edge.mac)?;
                Some(vec![
                    device.name.clone(),
                    device.device_type.to_string(),
                    device.mac.to_string(),
                    format_ip(device),
                    self.name_of(edge.switch_mac),
                    edge.switch_port.to_string(),
                    if device.reachable { "yes" } else { "NO" }.to_string(),
                ])
            })
            .collect();
        connected.sort();

        let with_edge: HashSet<MacAddress> = self.edges.iter().map(|e| e.mac).collect();
        let mut replaced: Vec<Vec<String>> = self
            .devices
            .values()
            .filter(|d| !with_edge.contains(&d.mac) && !switches.contains(&d.mac))
            .map(|d| {
                vec![
                    d.name.clone(),
                    d.device_type.to_string(),
                    d.mac.to_string(),
                    format_ip(d),
                ]
            })
            .collect();
        replaced.sort();

        let mut out = format_table(
            "Connected devices",
            &["name", "type", "mac", "ip", "switch", "port", "reachable"],
            &connected,
        );
        out.push('\n');
        out.push_str(&format_table(
            "Replaced devices",
            &["name", "type", "mac", "ip"],
            &replaced,
        ));
        out
    }
}

fn format_ip(device: &Device) -> String {
    device.ip.map_or_else(|| "-".to_string(), |ip| ip.to_string())
}

fn format_table(title: &str, headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = format!("{title}:\n");
    if rows.is_empty() {
        out.push_str("  (none)\n");
        return out;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    push_row(&mut out, headers, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_row(&mut out, &rule, &widths);
    for row in rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row<S: AsRef<str>>(out: &mut String, cells: &[S], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{:<width$}", cell.as_ref()))
        .collect();
    let _ = writeln!(out, "  {}", line.join("  ").trim_end());
}

#[derive(Debug, Clone, Copy)]
struct TreeEntry {
    depth: usize,
    port: Option<u32>,
    mac: MacAddress,
}

/// Depth-first iterator over the topology tree.
///
/// Each device is rendered at most once, so cycles in stored edges are cut.
#[derive(Debug)]
pub struct TreeLines {
    devices: HashMap<MacAddress, Device>,
    children: HashMap<MacAddress, Vec<(u32, MacAddress)>>,
    stack: Vec<TreeEntry>,
    visited: HashSet<MacAddress>,
}

impl Iterator for TreeLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let entry = self.stack.pop()?;
            if !self.visited.insert(entry.mac) {
                continue;
            }

            if let Some(children) = self.children.get(&entry.mac) {
                for &(port, mac) in children.iter().rev() {
                    self.stack.push(TreeEntry {
                        depth: entry.depth + 1,
                        port: Some(port),
                        mac,
                    });
                }
            }

            let label = match self.devices.get(&entry.mac) {
                Some(device) if device.reachable => device.name.clone(),
                Some(device) => format!("[{}]", device.name),
                None => format!("[{}]", entry.mac),
            };
            let indent = "  ".repeat(entry.depth);
            return Some(match entry.port {
                Some(port) => format!("{indent}port {port}: {label}"),
                None => format!("{indent}{label}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use walt_common::DeviceType;

    fn device(last: u8, name: &str, device_type: DeviceType, reachable: bool) -> Device {
        Device {
            mac: MacAddress([0, 0, 0, 0, 0, last]),
            name: name.to_string(),
            device_type,
            ip: None,
            reachable,
        }
    }

    fn edge(mac: u8, switch: u8, port: u32) -> TopologyEdge {
        TopologyEdge {
            mac: MacAddress([0, 0, 0, 0, 0, mac]),
            switch_mac: MacAddress([0, 0, 0, 0, 0, switch]),
            switch_port: port,
        }
    }

    fn fabric() -> TopologySnapshot {
        TopologySnapshot::new(
            vec![
                device(1, "switch-a", DeviceType::Switch, true),
                device(2, "switch-b", DeviceType::Switch, true),
                device(3, "node1", DeviceType::node("rpi-3-b"), true),
                device(4, "node2", DeviceType::node("rpi-3-b"), false),
                device(5, "walt-server", DeviceType::Server, true),
                device(6, "node3", DeviceType::node("rpi-4-b"), false),
            ],
            vec![
                edge(5, 1, 24),
                edge(2, 1, 8),
                edge(3, 2, 1),
                edge(4, 2, 2),
            ],
        )
    }

    #[test]
    fn test_tree_lines() {
        let lines: Vec<String> = fabric().into_tree().collect();
        assert_eq!(
            lines,
            vec![
                "switch-a",
                "  port 8: switch-b",
                "    port 1: node1",
                "    port 2: [node2]",
                "  port 24: walt-server",
            ]
        );
    }

    #[test]
    fn test_tree_cuts_cycles() {
        let snapshot = TopologySnapshot::new(
            vec![
                device(1, "switch-a", DeviceType::Switch, true),
                device(2, "switch-b", DeviceType::Switch, true),
                device(3, "switch-c", DeviceType::Switch, true),
            ],
            // switch-b and switch-c point at each other
            vec![edge(2, 1, 1), edge(3, 2, 1), edge(2, 3, 1)],
        );
        let lines: Vec<String> = snapshot.into_tree().collect();
        assert_eq!(
            lines,
            vec!["switch-a", "  port 1: switch-b", "    port 1: switch-c"]
        );
    }

    #[test]
    fn test_show_lists_replaced_devices() {
        let out = fabric().show();
        let (connected, replaced) = out.split_once("Replaced devices:").unwrap();
        assert!(connected.contains("node2"));
        assert!(replaced.contains("node3"));
        assert!(!replaced.contains("switch-a"));
        assert!(!replaced.contains("node1"));
    }

    #[test]
    fn test_show_empty_tables() {
        let out = TopologySnapshot::new(vec![], vec![]).show();
        assert_eq!(
            out,
            "Connected devices:\n  (none)\n\nReplaced devices:\n  (none)\n"
        );
    }
}
