use crate::adb::AdbClient;
use crate::core::{HarnessError, Result};
use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub struct ThroughputRunner {
    client: AdbClient,
}

impl ThroughputRunner {
    pub fn new(client: AdbClient) -> Self {
        Self { client }
    }

    /// Run iperf3 on the device against `server` and return the receiver-side
    /// rate in Mbit/s.
    pub async fn iperf_throughput(
        &self,
        serial: &str,
        server: &str,
        secs: u64,
        reverse: bool,
    ) -> Result<f64> {
        let secs_arg = secs.to_string();
        let mut cmd = vec!["iperf3", "-c", server, "-t", &secs_arg, "-f", "m"];
        if reverse {
            cmd.push("-R");
        }
        let limit = Duration::from_secs(secs + 30);
        let (ok, stdout, stderr) = self
            .client
            .try_shell_with_timeout(serial, &cmd, limit)
            .await?;
        let combined = format!("{stdout}\n{stderr}");
        if combined.contains("not found") || combined.contains("No such file") {
            return Err(HarnessError::ToolMissing("iperf3".to_string()));
        }
        if !ok {
            return Err(HarnessError::CommandFailed(format!(
                "iperf3 failed: {}",
                stderr.trim()
            )));
        }
        parse_iperf_mbps(&stdout).ok_or_else(|| {
            HarnessError::Parse(format!(
                "no receiver rate in iperf3 output: {}",
                stdout.trim()
            ))
        })
    }

    pub async fn interface_bytes(&self, serial: &str, iface: &str) -> Result<(u64, u64)> {
        let out = self.client.shell(serial, &["cat", "/proc/net/dev"]).await?;
        parse_iface_bytes(&out, iface)
            .ok_or_else(|| HarnessError::Parse(format!("interface {iface} not present")))
    }

    /// Push traffic through the proxy with `transfer_cmd` under a bounded
    /// background task, and derive Mbit/s from the interface byte counters.
    pub async fn proxy_throughput(
        &self,
        serial: &str,
        iface: &str,
        transfer_cmd: &str,
        limit: Duration,
    ) -> Result<f64> {
        let parts: Vec<String> = transfer_cmd.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            return Err(HarnessError::Config("empty transfer command".to_string()));
        }
        let (rx0, _) = self.interface_bytes(serial, iface).await?;
        let start = Instant::now();

        let client = self.client.clone();
        let serial_owned = serial.to_string();
        let handle = tokio::spawn(async move {
            let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
            client
                .try_shell_with_timeout(&serial_owned, &refs, limit)
                .await
        });
        match tokio::time::timeout(limit + Duration::from_secs(5), handle).await {
            Ok(Ok(Ok((true, _, _)))) => {}
            Ok(Ok(Ok((false, stdout, stderr)))) => {
                let detail = format!("{} {}", stdout.trim(), stderr.trim());
                if detail.contains("not found") || detail.contains("No such file") {
                    return Err(HarnessError::ToolMissing(transfer_cmd.to_string()));
                }
                return Err(HarnessError::CommandFailed(format!(
                    "transfer failed: {detail}"
                )));
            }
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(join_err)) => return Err(HarnessError::CommandFailed(join_err.to_string())),
            Err(_) => return Err(HarnessError::Timeout(limit.as_secs() + 5)),
        }

        let elapsed = start.elapsed().as_secs_f64();
        let (rx1, _) = self.interface_bytes(serial, iface).await?;
        let bytes = rx1.saturating_sub(rx0);
        if elapsed <= 0.0 || bytes == 0 {
            return Err(HarnessError::Parse(format!("no traffic observed on {iface}")));
        }
        Ok((bytes as f64 * 8.0) / (elapsed * 1_000_000.0))
    }
}

pub(crate) fn parse_iperf_mbps(out: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"([\d.]+)\s+([KMG])bits/sec.*receiver").expect("static regex")
    });
    for line in out.lines() {
        if let Some(caps) = re.captures(line) {
            let value: f64 = caps[1].parse().ok()?;
            let scale = match &caps[2] {
                "K" => 0.001,
                "G" => 1000.0,
                _ => 1.0,
            };
            return Some(value * scale);
        }
    }
    None
}

pub(crate) fn parse_iface_bytes(out: &str, iface: &str) -> Option<(u64, u64)> {
    for line in out.lines().skip(2) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }
        let name = parts[0].trim_end_matches(':');
        if name != iface {
            continue;
        }
        let rx: u64 = parts[1].parse().unwrap_or(0);
        let tx: u64 = parts[9].parse().unwrap_or(0);
        return Some((rx, tx));
    }
    None
}
