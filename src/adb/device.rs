use crate::adb::client::AdbClient;
use crate::core::poll::{self, PollSpec};
use crate::core::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,
    pub state: String,
    pub product: Option<String>,
    pub model: Option<String>,
    pub android_version: Option<String>,
    pub sdk_version: Option<String>,
}

impl Device {
    pub fn display_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        if let Some(product) = &self.product {
            return product.clone();
        }
        self.serial.clone()
    }

    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

pub struct DeviceManager {
    client: AdbClient,
}

impl DeviceManager {
    pub fn new(client: AdbClient) -> Self {
        Self { client }
    }

    /// All devices adb knows about, including offline/unauthorized ones.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let (output, _) = self.client.execute(&["devices", "-l"]).await?;
        Ok(parse_device_lines(&output))
    }

    /// One device with android/sdk versions filled in from getprop.
    pub async fn describe(&self, serial: &str) -> Result<Device> {
        let devices = self.list_devices().await?;
        let mut device = devices
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| HarnessError::DeviceNotFound(serial.to_string()))?;
        if device.is_online() {
            let props = self.get_properties(serial).await.unwrap_or_default();
            if device.model.is_none() {
                device.model = props.get("ro.product.model").cloned();
            }
            if device.product.is_none() {
                device.product = props.get("ro.build.product").cloned();
            }
            device.android_version = props.get("ro.build.version.release").cloned();
            device.sdk_version = props.get("ro.build.version.sdk").cloned();
        }
        Ok(device)
    }

    /// Pick the device to test: the requested serial, or the single online
    /// device when no serial was given.
    pub async fn pick(&self, requested: Option<&str>) -> Result<Device> {
        let devices = self.list_devices().await?;
        let mut online: Vec<Device> = devices.into_iter().filter(Device::is_online).collect();
        match requested {
            Some(serial) => online
                .into_iter()
                .find(|d| d.serial == serial)
                .ok_or_else(|| HarnessError::DeviceNotFound(serial.to_string())),
            None => match online.len() {
                0 => Err(HarnessError::NoDevices),
                1 => Ok(online.remove(0)),
                n => Err(HarnessError::Config(format!(
                    "{n} devices connected; pass --serial"
                ))),
            },
        }
    }

    pub async fn get_properties(&self, serial: &str) -> Result<HashMap<String, String>> {
        let output = self.client.shell(serial, &["getprop"]).await?;
        Ok(parse_properties(&output))
    }

    pub async fn get_prop(&self, serial: &str, key: &str) -> Result<String> {
        let output = self.client.shell(serial, &["getprop", key]).await?;
        Ok(output.trim().to_string())
    }

    pub async fn reboot_bootloader(&self, serial: &str) -> Result<()> {
        self.client
            .execute(&["-s", serial, "reboot", "bootloader"])
            .await?;
        Ok(())
    }

    /// Poll `adb get-state` until the device reports `device`. Absence while
    /// rebooting is expected and counts as "not yet".
    pub async fn wait_until_online(&self, serial: &str, spec: PollSpec) -> Result<bool> {
        poll::until(spec, move || async move {
            match self.client.try_execute(&["-s", serial, "get-state"]).await {
                Ok((true, out, _)) => Ok(out.trim() == "device"),
                Ok(_) => Ok(false),
                Err(e) if e.is_device_gone() => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn battery_level(&self, serial: &str) -> Result<Option<u32>> {
        let output = self.client.shell(serial, &["dumpsys", "battery"]).await?;
        Ok(parse_battery_level(&output))
    }
}

fn parse_device_lines(output: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') || line.starts_with("List of devices") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let mut product = None;
        let mut model = None;
        for token in &parts[2..] {
            if let Some(v) = token.strip_prefix("product:") {
                product = Some(v.to_string());
            } else if let Some(v) = token.strip_prefix("model:") {
                model = Some(v.to_string());
            }
        }
        devices.push(Device {
            serial: parts[0].to_string(),
            state: parts[1].to_string(),
            product,
            model,
            android_version: None,
            sdk_version: None,
        });
    }
    devices
}

fn parse_properties(output: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with('[') {
            continue;
        }
        if let Some(idx) = line.find("]: [") {
            let key = &line[1..idx];
            let rest = &line[idx + 4..];
            if let Some(end) = rest.rfind(']') {
                props.insert(key.to_string(), rest[..end].to_string());
            }
        }
    }
    props
}

fn parse_battery_level(output: &str) -> Option<u32> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("level:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_l_output() {
        let out = "List of devices attached\n\
                   8XV7N15A29002144       device usb:1-2 product:sturgeon model:Huawei_Watch device:sturgeon\n\
                   emulator-5554          offline\n\
                   2a6b0c9d               unauthorized usb:1-3\n";
        let devices = parse_device_lines(out);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "8XV7N15A29002144");
        assert_eq!(devices[0].product.as_deref(), Some("sturgeon"));
        assert_eq!(devices[0].model.as_deref(), Some("Huawei_Watch"));
        assert!(devices[0].is_online());
        assert!(!devices[1].is_online());
        assert_eq!(devices[2].state, "unauthorized");
    }

    #[test]
    fn parses_getprop_output() {
        let out = "[ro.build.product]: [sturgeon]\n\
                   [ro.build.version.release]: [8.0.0]\n\
                   [ro.build.version.sdk]: [26]\n\
                   not a prop line\n";
        let props = parse_properties(out);
        assert_eq!(props.get("ro.build.product").map(String::as_str), Some("sturgeon"));
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn parses_battery_level() {
        let out = "Current Battery Service state:\n  AC powered: false\n  level: 87\n  scale: 100\n";
        assert_eq!(parse_battery_level(out), Some(87));
        assert_eq!(parse_battery_level("no level here"), None);
    }
}
