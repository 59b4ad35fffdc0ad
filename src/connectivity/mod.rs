pub mod throughput;

use crate::adb::AdbClient;
use crate::core::poll::{self, PollSpec};
use crate::core::{HarnessError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Shared device-state utilities used by every suite.
pub struct ConnectivityHelper {
    client: AdbClient,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub loss_pct: f64,
    pub avg_rtt_ms: Option<f64>,
}

impl ConnectivityHelper {
    pub fn new(client: AdbClient) -> Self {
        Self { client }
    }

    pub async fn bluetooth_enabled(&self, serial: &str) -> Result<bool> {
        let out = self
            .client
            .shell(serial, &["settings", "get", "global", "bluetooth_on"])
            .await?;
        Ok(out.trim() == "1")
    }

    pub async fn set_bluetooth(&self, serial: &str, on: bool) -> Result<()> {
        let arg = if on { "enable" } else { "disable" };
        self.client.shell(serial, &["svc", "bluetooth", arg]).await?;
        Ok(())
    }

    pub async fn set_airplane_mode(&self, serial: &str, on: bool) -> Result<()> {
        let flag = if on { "1" } else { "0" };
        self.client
            .shell(serial, &["settings", "put", "global", "airplane_mode_on", flag])
            .await?;
        let state = if on { "true" } else { "false" };
        self.client
            .shell(
                serial,
                &[
                    "am",
                    "broadcast",
                    "-a",
                    "android.intent.action.AIRPLANE_MODE",
                    "--ez",
                    "state",
                    state,
                ],
            )
            .await?;
        Ok(())
    }

    /// Poll `dumpsys bluetooth_manager` until the peer's ACL state matches
    /// `want_connected`.
    pub async fn validate_connection_state(
        &self,
        serial: &str,
        peer_mac: &str,
        want_connected: bool,
        spec: PollSpec,
    ) -> Result<bool> {
        let peer_upper = peer_mac.to_uppercase();
        let peer: &str = &peer_upper;
        poll::until(spec, move || async move {
            match self
                .client
                .try_shell(serial, &["dumpsys", "bluetooth_manager"])
                .await
            {
                Ok((true, out, _)) => Ok(acl_connected(&out, peer) == want_connected),
                Ok(_) => Ok(false),
                Err(e) if e.is_device_gone() => Err(e),
                Err(_) => Ok(false),
            }
        })
        .await
    }

    pub async fn post_notification(&self, serial: &str, tag: &str, text: &str) -> Result<()> {
        self.client
            .shell(
                serial,
                &[
                    "cmd",
                    "notification",
                    "post",
                    "-S",
                    "bigtext",
                    "-t",
                    "droidstress",
                    tag,
                    text,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn validate_notification_via_dumpsys(
        &self,
        serial: &str,
        tag: &str,
        spec: PollSpec,
    ) -> Result<bool> {
        let needle = format!("tag={tag}");
        poll::cmd_validate(
            &self.client,
            serial,
            &["dumpsys", "notification", "--noredact"],
            &needle,
            spec,
        )
        .await
    }

    pub async fn clear_notifications(&self, serial: &str) -> Result<()> {
        // transaction 1 is cancelAllNotifications
        self.client
            .shell(serial, &["service", "call", "notification", "1"])
            .await?;
        Ok(())
    }

    /// Poll the NAT table for the proxy's redirect rule. Needs adb root.
    pub async fn validate_proxy_iptable(
        &self,
        serial: &str,
        port: u16,
        spec: PollSpec,
    ) -> Result<bool> {
        let pattern = proxy_rule_pattern(port)?;
        poll::cmd_validate_regex(
            &self.client,
            serial,
            &["iptables", "-t", "nat", "-L", "-n"],
            &pattern,
            spec,
        )
        .await
    }

    /// Run on-device ping inside a background task so a wedged radio cannot
    /// hang the suite. `None` means the ping never produced a summary.
    pub async fn ping_test(
        &self,
        serial: &str,
        host: &str,
        count: u32,
        limit: Duration,
    ) -> Result<Option<PingStats>> {
        let client = self.client.clone();
        let serial_owned = serial.to_string();
        let host_owned = host.to_string();
        let count_arg = count.to_string();
        let handle = tokio::spawn(async move {
            client
                .try_shell_with_timeout(
                    &serial_owned,
                    &["ping", "-c", &count_arg, "-W", "2", &host_owned],
                    limit + Duration::from_secs(5),
                )
                .await
        });
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(Ok((_, stdout, _)))) => Ok(parse_ping(&stdout)),
            Ok(Ok(Err(e))) if e.is_device_gone() => Err(e),
            Ok(Ok(Err(_))) => Ok(None),
            Ok(Err(join_err)) => Err(HarnessError::CommandFailed(join_err.to_string())),
            Err(_) => Ok(None),
        }
    }

    pub async fn wifi_connected(&self, serial: &str) -> Result<bool> {
        let (ok, out, _) = self.client.try_shell(serial, &["dumpsys", "wifi"]).await?;
        Ok(ok && wifi_state_connected(&out))
    }

    /// Dump a bounded logcat snapshot into the results directory for triage.
    pub async fn capture_failure_logs(
        &self,
        serial: &str,
        dir: &Path,
        case: &str,
    ) -> Result<PathBuf> {
        let dump = self.client.logcat_dump(serial, 500).await?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{case}-logcat.txt"));
        tokio::fs::write(&path, dump).await?;
        Ok(path)
    }
}

fn mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b([0-9A-F]{2}:){5}[0-9A-F]{2}\b").expect("static regex")
    })
}

pub(crate) fn proxy_rule_pattern(port: u16) -> Result<Regex> {
    Regex::new(&format!(r"(redir ports {port}\b|dpt:{port}\b)"))
        .map_err(|e| HarnessError::Parse(e.to_string()))
}

/// MACs listed under an indented dumpsys section such as `Bonded devices:`.
pub(crate) fn section_macs(dump: &str, header: &str) -> Vec<String> {
    let mut macs = Vec::new();
    let mut in_section = false;
    for line in dump.lines() {
        let trimmed = line.trim();
        if trimmed == header || trimmed.ends_with(header) {
            in_section = true;
            continue;
        }
        if in_section {
            // the section is the run of MAC-bearing lines under the header
            match mac_re().find(trimmed) {
                Some(m) => macs.push(m.as_str().to_uppercase()),
                None => in_section = false,
            }
        }
    }
    macs
}

/// Whether the peer shows as ACL-connected in a `dumpsys bluetooth_manager`
/// dump. Accepts both the adapter-properties section form and the
/// per-profile `ConnectionState:` form.
pub(crate) fn acl_connected(dump: &str, peer_mac: &str) -> bool {
    let peer = peer_mac.to_uppercase();
    if section_macs(dump, "Connected devices:").contains(&peer) {
        return true;
    }
    let lines: Vec<&str> = dump.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if line.to_uppercase().contains(&peer) {
            let end = (i + 7).min(lines.len());
            for follow in &lines[i..end] {
                if follow.contains("STATE_CONNECTED") || follow.contains("Connected: true") {
                    return true;
                }
            }
        }
    }
    false
}

pub(crate) fn wifi_state_connected(dump: &str) -> bool {
    dump.lines().any(|l| {
        let t = l.trim();
        (t.starts_with("mNetworkInfo") && t.contains("state: CONNECTED"))
            || t.contains("curState=ConnectedState")
            || t.contains("curState=L3ConnectedState")
    })
}

pub(crate) fn parse_ping(out: &str) -> Option<PingStats> {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    static RTT: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(\d+) packets transmitted, (\d+)\s+(?:packets )?received.*?([\d.]+)% packet loss")
            .expect("static regex")
    });
    let rtt = RTT.get_or_init(|| {
        Regex::new(r"rtt min/avg/max(?:/mdev)? = [\d.]+/([\d.]+)/").expect("static regex")
    });
    let caps = summary.captures(out)?;
    let transmitted = caps[1].parse().ok()?;
    let received = caps[2].parse().ok()?;
    let loss_pct = caps[3].parse().ok()?;
    let avg_rtt_ms = rtt
        .captures(out)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    Some(PingStats {
        transmitted,
        received,
        loss_pct,
        avg_rtt_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADAPTER_DUMP: &str = "\
Bluetooth Status
  enabled: true
  state: ON
  address: 11:22:33:44:55:66
  Bonded devices:
    AA:BB:CC:DD:EE:FF [ DUAL ] Pixel 4
  Connected devices:
    AA:BB:CC:DD:EE:FF [ DUAL ] Pixel 4
  Profile: HeadsetService
";

    const PROFILE_DUMP: &str = "\
Profile: A2dpService
  Devices:
    Device: AA:BB:CC:DD:EE:FF
      name: Pixel 4
      ConnectionState: STATE_CONNECTED
";

    const DISCONNECTED_DUMP: &str = "\
  Bonded devices:
    AA:BB:CC:DD:EE:FF [ DUAL ] Pixel 4
  Connected devices:
  Profile: A2dpService
    Device: AA:BB:CC:DD:EE:FF
      ConnectionState: STATE_DISCONNECTED
";

    #[test]
    fn detects_connection_in_adapter_section() {
        assert!(acl_connected(ADAPTER_DUMP, "aa:bb:cc:dd:ee:ff"));
        assert!(!acl_connected(ADAPTER_DUMP, "00:11:22:33:44:55"));
    }

    #[test]
    fn detects_connection_in_profile_dump() {
        assert!(acl_connected(PROFILE_DUMP, "AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn bonded_but_disconnected_is_not_connected() {
        assert!(!acl_connected(DISCONNECTED_DUMP, "AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn section_walk_stops_at_next_header() {
        let macs = section_macs(ADAPTER_DUMP, "Bonded devices:");
        assert_eq!(macs, vec!["AA:BB:CC:DD:EE:FF".to_string()]);
    }

    #[test]
    fn parses_ping_summary_with_rtt() {
        let out = "\
PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=118 time=23.4 ms

--- 8.8.8.8 ping statistics ---
10 packets transmitted, 9 received, 10% packet loss, time 9012ms
rtt min/avg/max/mdev = 21.123/24.567/31.002/2.882 ms
";
        let stats = parse_ping(out).unwrap();
        assert_eq!(stats.transmitted, 10);
        assert_eq!(stats.received, 9);
        assert_eq!(stats.loss_pct, 10.0);
        assert_eq!(stats.avg_rtt_ms, Some(24.567));
    }

    #[test]
    fn parses_total_loss_without_rtt_line() {
        let out = "\
--- 10.0.0.1 ping statistics ---
4 packets transmitted, 0 received, 100% packet loss, time 3060ms
";
        let stats = parse_ping(out).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.loss_pct, 100.0);
        assert_eq!(stats.avg_rtt_ms, None);
    }

    #[test]
    fn no_summary_means_no_stats() {
        assert!(parse_ping("ping: unknown host example.invalid").is_none());
    }

    #[test]
    fn wifi_state_forms() {
        assert!(wifi_state_connected(
            "mNetworkInfo [type: WIFI[], state: CONNECTED/CONNECTED, reason: (unspecified)]"
        ));
        assert!(wifi_state_connected("curState=ConnectedState"));
        assert!(!wifi_state_connected(
            "mNetworkInfo [type: WIFI[], state: DISCONNECTED/DISCONNECTED]"
        ));
    }

    #[test]
    fn proxy_rule_matches_redirect_forms() {
        let re = proxy_rule_pattern(1080).unwrap();
        assert!(re.is_match(
            "REDIRECT   tcp  --  0.0.0.0/0   0.0.0.0/0   tcp dpt:80 redir ports 1080"
        ));
        assert!(re.is_match("DNAT  tcp dpt:1080 to::5555"));
        assert!(!re.is_match("REDIRECT tcp dpt:80 redir ports 10800"));
    }
}
