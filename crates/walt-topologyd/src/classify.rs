//! Device classification from hardware addresses.

use std::collections::{BTreeMap, BTreeSet};
use walt_common::{DeviceType, MacAddress, TopologyConfig};

/// Maps hardware addresses to device types using OUI prefix tables.
#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    server_mac: MacAddress,
    switch_ouis: BTreeSet<String>,
    /// OUI → node model
    node_ouis: BTreeMap<String, String>,
}

impl DeviceClassifier {
    pub fn new(config: &TopologyConfig, server_mac: MacAddress) -> Self {
        Self {
            server_mac,
            switch_ouis: config
                .switch_ouis
                .iter()
                .map(|oui| oui.to_ascii_lowercase())
                .collect(),
            node_ouis: config
                .node_ouis
                .iter()
                .map(|(oui, model)| (oui.to_ascii_lowercase(), model.clone()))
                .collect(),
        }
    }

    pub fn server_mac(&self) -> MacAddress {
        self.server_mac
    }

    /// Classify a hardware address.
    pub fn classify(&self, mac: MacAddress) -> DeviceType {
        if mac == self.server_mac {
            return DeviceType::Server;
        }
        let oui = mac.oui();
        if self.switch_ouis.contains(&oui) {
            return DeviceType::Switch;
        }
        match self.node_ouis.get(&oui) {
            Some(model) => DeviceType::node(model.clone()),
            None => DeviceType::node(DeviceType::UNKNOWN_MODEL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classifier() -> DeviceClassifier {
        let mut config = TopologyConfig::default();
        config.switch_ouis.push("AA:BB:CC".to_string());
        DeviceClassifier::new(&config, "52:54:00:00:00:01".parse().unwrap())
    }

    #[test]
    fn test_classify() {
        let classifier = classifier();
        let classify = |mac: &str| classifier.classify(mac.parse().unwrap());

        assert_eq!(classify("52:54:00:00:00:01"), DeviceType::Server);
        assert_eq!(classify("a0:40:a0:12:34:56"), DeviceType::Switch);
        assert_eq!(classify("aa:bb:cc:12:34:56"), DeviceType::Switch);
        assert_eq!(classify("dc:a6:32:12:34:56"), DeviceType::node("rpi-4-b"));
        assert_eq!(
            classify("02:00:00:12:34:56"),
            DeviceType::node(DeviceType::UNKNOWN_MODEL)
        );
    }
}
