use crate::adb::AdbClient;
use crate::connectivity::section_macs;
use crate::core::poll::{self, PollSpec};
use crate::core::Result;
use std::time::Duration;

/// Watch/phone pairing automation: bond-table inspection, unpairing, and
/// driving the consent dialog.
pub struct PairingUtils {
    client: AdbClient,
}

impl PairingUtils {
    pub fn new(client: AdbClient) -> Self {
        Self { client }
    }

    pub async fn bonded_devices(&self, serial: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .shell(serial, &["dumpsys", "bluetooth_manager"])
            .await?;
        Ok(parse_bonded(&out))
    }

    pub async fn is_bonded(&self, serial: &str, peer_mac: &str) -> Result<bool> {
        let peer = peer_mac.to_uppercase();
        Ok(self.bonded_devices(serial).await?.contains(&peer))
    }

    /// Drop every bond. Factory-reset of the stack is the clean path; on
    /// builds without it, wipe the bond table as root and bounce bluetooth.
    pub async fn clear_bonds(&self, serial: &str) -> Result<()> {
        let (ok, _, _) = self
            .client
            .try_shell(serial, &["cmd", "bluetooth_manager", "factory-reset"])
            .await?;
        if ok {
            return Ok(());
        }
        self.client.root(serial).await?;
        self.client
            .shell(serial, &["svc", "bluetooth", "disable"])
            .await?;
        let _ = self
            .client
            .try_shell(serial, &["rm", "-f", "/data/misc/bluedroid/bt_config.conf"])
            .await?;
        self.client
            .shell(serial, &["svc", "bluetooth", "enable"])
            .await?;
        Ok(())
    }

    /// Kick off a bond to the peer through the lab companion receiver.
    pub async fn start_pairing(&self, serial: &str, peer_mac: &str, action: &str) -> Result<()> {
        self.client
            .shell(
                serial,
                &["am", "broadcast", "-a", action, "--es", "address", peer_mac],
            )
            .await?;
        Ok(())
    }

    /// Walk the consent dialog with confirm keyevents.
    pub async fn accept_consent(&self, serial: &str, taps: u32, delay: Duration) -> Result<()> {
        for _ in 0..taps {
            self.client
                .shell(serial, &["input", "keyevent", "KEYCODE_DPAD_CENTER"])
                .await?;
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    pub async fn wait_bonded(&self, serial: &str, peer_mac: &str, spec: PollSpec) -> Result<bool> {
        let peer_upper = peer_mac.to_uppercase();
        let peer: &str = &peer_upper;
        poll::until(spec, move || async move {
            match self
                .client
                .try_shell(serial, &["dumpsys", "bluetooth_manager"])
                .await
            {
                Ok((true, out, _)) => Ok(parse_bonded(&out).iter().any(|m| m == peer)),
                Ok(_) => Ok(false),
                Err(e) if e.is_device_gone() => Err(e),
                Err(_) => Ok(false),
            }
        })
        .await
    }
}

/// Bonded MACs from a `dumpsys bluetooth_manager` dump. Accepts the
/// adapter-properties section form and the per-device `BondState:` form.
pub(crate) fn parse_bonded(dump: &str) -> Vec<String> {
    let macs = section_macs(dump, "Bonded devices:");
    if !macs.is_empty() {
        return macs;
    }
    let lines: Vec<&str> = dump.lines().collect();
    let mut bonded = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(rest) = line.trim().strip_prefix("Device:") {
            let mac = rest.trim().to_uppercase();
            let end = (i + 5).min(lines.len());
            if lines[i..end]
                .iter()
                .any(|l| l.contains("BondState: BONDED"))
                && !bonded.contains(&mac)
            {
                bonded.push(mac);
            }
        }
    }
    bonded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bonded_section() {
        let dump = "\
  Bonded devices:
    AA:BB:CC:DD:EE:FF [ DUAL ] Pixel 4
    11:22:33:44:55:66 [ BREDR ] Car Kit
  Connected devices:
";
        assert_eq!(
            parse_bonded(dump),
            vec!["AA:BB:CC:DD:EE:FF".to_string(), "11:22:33:44:55:66".to_string()]
        );
    }

    #[test]
    fn reads_per_device_bond_state() {
        let dump = "\
Profile: AdapterService
  Device: aa:bb:cc:dd:ee:ff
    name: Pixel 4
    BondState: BONDED
  Device: 11:22:33:44:55:66
    name: Stray Beacon
    BondState: NONE
";
        assert_eq!(parse_bonded(dump), vec!["AA:BB:CC:DD:EE:FF".to_string()]);
    }

    #[test]
    fn empty_dump_has_no_bonds() {
        assert!(parse_bonded("Bluetooth Status\n  enabled: false\n").is_empty());
    }
}
