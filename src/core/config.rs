use crate::core::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Plan file: one `[run]` section plus one optional section per suite.
/// Unknown keys are rejected so typos surface instead of silently using
/// defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PlanConfig {
    pub run: RunSection,
    pub gate: GateSection,
    pub bt_reconnect: BtReconnectSection,
    pub bt_throughput: BtThroughputSection,
    pub pairing: PairingSection,
    pub wifi: WifiSection,
}

impl PlanConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub iterations: u32,
    pub results_dir: PathBuf,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            iterations: 10,
            results_dir: PathBuf::from("results"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateSection {
    /// host:port of the tested-build counting service; no gate when unset.
    pub endpoint: Option<String>,
    pub max_runs: u32,
    /// "per-build" or "per-flavor"
    pub policy: String,
    /// Defaults to ro.build.version.incremental from the device.
    pub build_id: Option<String>,
    /// Defaults to ro.build.flavor from the device.
    pub flavor: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_runs: 3,
            policy: "per-build".to_string(),
            build_id: None,
            flavor: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BtReconnectSection {
    /// MAC of the companion the device must reconnect to. Required.
    pub peer_mac: Option<String>,
    /// Serial of the companion phone; notifications are posted there when set.
    pub companion_serial: Option<String>,
    /// Alternate odd iterations through airplane mode instead of a plain
    /// bluetooth toggle.
    pub alternate_airplane: bool,
    pub disconnect_timeout_secs: u64,
    pub reconnect_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub notification_timeout_secs: u64,
    pub settle_secs: u64,
}

impl Default for BtReconnectSection {
    fn default() -> Self {
        Self {
            peer_mac: None,
            companion_serial: None,
            alternate_airplane: false,
            disconnect_timeout_secs: 30,
            reconnect_timeout_secs: 120,
            poll_interval_secs: 2,
            notification_timeout_secs: 60,
            settle_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BtThroughputSection {
    /// Interface carrying proxied traffic.
    pub iface: String,
    /// Device-side command that pushes traffic through the proxy.
    pub transfer_cmd: String,
    pub transfer_timeout_secs: u64,
    pub floor_mbps: f64,
    /// NAT redirect port the proxy is expected to own.
    pub proxy_port: u16,
    pub iptable_timeout_secs: u64,
}

impl Default for BtThroughputSection {
    fn default() -> Self {
        Self {
            iface: "bt-pan".to_string(),
            transfer_cmd: "sysproxyctl benchmark".to_string(),
            transfer_timeout_secs: 180,
            floor_mbps: 0.25,
            proxy_port: 1080,
            iptable_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PairingSection {
    /// MAC of the peer to bond with. Required.
    pub peer_mac: Option<String>,
    /// Broadcast action the lab companion app listens on to start a bond.
    pub pair_action: String,
    /// Keyevent taps used to walk the consent dialog.
    pub consent_taps: u32,
    pub tap_delay_secs: u64,
    pub bond_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub settle_secs: u64,
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            peer_mac: None,
            pair_action: "com.android.devicelab.action.PAIR".to_string(),
            consent_taps: 2,
            tap_delay_secs: 2,
            bond_timeout_secs: 90,
            poll_interval_secs: 5,
            settle_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WifiSection {
    /// iperf3 server to measure against; ping-only when unset.
    pub iperf_server: Option<String>,
    pub iperf_secs: u64,
    pub ping_host: String,
    pub ping_count: u32,
    /// host:port of the RF attenuator; a single baseline pass when unset.
    pub attenuator: Option<String>,
    pub atten_start: u32,
    pub atten_stop: u32,
    pub atten_step: u32,
    pub dwell_secs: u64,
}

impl Default for WifiSection {
    fn default() -> Self {
        Self {
            iperf_server: None,
            iperf_secs: 10,
            ping_host: "8.8.8.8".to_string(),
            ping_count: 10,
            attenuator: None,
            atten_start: 0,
            atten_stop: 30,
            atten_step: 10,
            dwell_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_plan_gives_defaults() {
        let plan: PlanConfig = toml::from_str("").unwrap();
        assert_eq!(plan.run.iterations, 10);
        assert_eq!(plan.bt_throughput.iface, "bt-pan");
        assert!(plan.gate.endpoint.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let plan: PlanConfig = toml::from_str(
            r#"
            [run]
            iterations = 50

            [bt_reconnect]
            peer_mac = "AA:BB:CC:DD:EE:FF"
            alternate_airplane = true

            [wifi]
            attenuator = "lab-atten:2323"
            atten_stop = 60
            "#,
        )
        .unwrap();
        assert_eq!(plan.run.iterations, 50);
        assert_eq!(plan.bt_reconnect.peer_mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(plan.bt_reconnect.alternate_airplane);
        assert_eq!(plan.wifi.atten_stop, 60);
        // untouched sections keep their defaults
        assert_eq!(plan.pairing.bond_timeout_secs, 90);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<PlanConfig>("[run]\niteratons = 5\n").unwrap_err();
        assert!(err.to_string().contains("iteratons"));
    }
}
