use crate::core::{HarnessError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// The external counting service tracking how often a build was already
/// stress-tested.
#[async_trait]
pub trait TestedCounts: Send + Sync {
    async fn tested_count(&self, build_id: &str, flavor: &str) -> Result<u32>;
    async fn record_run(&self, build_id: &str, flavor: &str) -> Result<()>;
}

/// Line-protocol client: `COUNT <build> <flavor>` -> `OK <n>`,
/// `RECORD <build> <flavor>` -> `OK`, errors as `ERR <msg>`.
pub struct TcpCounts {
    addr: String,
    io_timeout: Duration,
}

impl TcpCounts {
    pub fn new(addr: String, io_timeout: Duration) -> Self {
        Self { addr, io_timeout }
    }

    async fn roundtrip(&self, line: &str) -> Result<String> {
        let deadline = self.io_timeout;
        let stream = timeout(deadline, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| HarnessError::Timeout(deadline.as_secs()))??;
        let (reader, mut writer) = stream.into_split();
        let msg = format!("{line}\n");
        timeout(deadline, writer.write_all(msg.as_bytes()))
            .await
            .map_err(|_| HarnessError::Timeout(deadline.as_secs()))??;
        let mut reply = String::new();
        let n = timeout(deadline, BufReader::new(reader).read_line(&mut reply))
            .await
            .map_err(|_| HarnessError::Timeout(deadline.as_secs()))??;
        if n == 0 {
            return Err(HarnessError::Gate("connection closed".to_string()));
        }
        let reply = reply.trim().to_string();
        if let Some(msg) = reply.strip_prefix("ERR") {
            return Err(HarnessError::Gate(msg.trim().to_string()));
        }
        Ok(reply)
    }
}

#[async_trait]
impl TestedCounts for TcpCounts {
    async fn tested_count(&self, build_id: &str, flavor: &str) -> Result<u32> {
        let reply = self.roundtrip(&format!("COUNT {build_id} {flavor}")).await?;
        let rest = reply
            .strip_prefix("OK")
            .ok_or_else(|| HarnessError::Gate(format!("unexpected reply: {reply}")))?;
        rest.trim()
            .parse()
            .map_err(|_| HarnessError::Gate(format!("bad count in reply: {reply}")))
    }

    async fn record_run(&self, build_id: &str, flavor: &str) -> Result<()> {
        let reply = self.roundtrip(&format!("RECORD {build_id} {flavor}")).await?;
        if reply.starts_with("OK") {
            Ok(())
        } else {
            Err(HarnessError::Gate(format!("unexpected reply: {reply}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    /// Count runs per build id alone.
    PerBuild,
    /// Count runs per build id + flavor pair.
    PerFlavor,
}

impl GatePolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "per-build" => Ok(GatePolicy::PerBuild),
            "per-flavor" => Ok(GatePolicy::PerFlavor),
            other => Err(HarnessError::Config(format!(
                "unknown gate policy '{other}'; expected per-build or per-flavor"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    Skip(String),
}

pub struct BuildGate {
    max_runs: u32,
    policy: GatePolicy,
}

impl BuildGate {
    pub fn new(max_runs: u32, policy: GatePolicy) -> Self {
        Self { max_runs, policy }
    }

    fn flavor_key<'a>(&self, flavor: &'a str) -> &'a str {
        match self.policy {
            GatePolicy::PerBuild => "",
            GatePolicy::PerFlavor => flavor,
        }
    }

    /// Skip when the build has already been tested `max_runs` times. An
    /// unreachable service fails open: the gate saves lab time, it must not
    /// block testing.
    pub async fn should_run(
        &self,
        counts: &dyn TestedCounts,
        build_id: &str,
        flavor: &str,
    ) -> GateDecision {
        match counts.tested_count(build_id, self.flavor_key(flavor)).await {
            Ok(n) if n >= self.max_runs => GateDecision::Skip(format!(
                "build {build_id} already tested {n} times (max {})",
                self.max_runs
            )),
            Ok(_) => GateDecision::Run,
            Err(e) => {
                warn!(error = %e, "counting service unavailable; running anyway");
                GateDecision::Run
            }
        }
    }

    pub async fn record(&self, counts: &dyn TestedCounts, build_id: &str, flavor: &str) {
        if let Err(e) = counts.record_run(build_id, self.flavor_key(flavor)).await {
            warn!(error = %e, "failed to record test run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    struct FakeCounts {
        counts: Mutex<HashMap<(String, String), u32>>,
        unavailable: bool,
    }

    impl FakeCounts {
        fn with(entries: &[(&str, &str, u32)]) -> Self {
            Self {
                counts: Mutex::new(
                    entries
                        .iter()
                        .map(|(b, f, n)| ((b.to_string(), f.to_string()), *n))
                        .collect(),
                ),
                unavailable: false,
            }
        }

        fn down() -> Self {
            Self {
                counts: Mutex::new(HashMap::new()),
                unavailable: true,
            }
        }
    }

    #[async_trait]
    impl TestedCounts for FakeCounts {
        async fn tested_count(&self, build_id: &str, flavor: &str) -> Result<u32> {
            if self.unavailable {
                return Err(HarnessError::Gate("connection refused".to_string()));
            }
            Ok(*self
                .counts
                .lock()
                .unwrap()
                .get(&(build_id.to_string(), flavor.to_string()))
                .unwrap_or(&0))
        }

        async fn record_run(&self, build_id: &str, flavor: &str) -> Result<()> {
            if self.unavailable {
                return Err(HarnessError::Gate("connection refused".to_string()));
            }
            *self
                .counts
                .lock()
                .unwrap()
                .entry((build_id.to_string(), flavor.to_string()))
                .or_insert(0) += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn skips_once_threshold_is_reached() {
        let counts = FakeCounts::with(&[("9912345", "", 3)]);
        let gate = BuildGate::new(3, GatePolicy::PerBuild);
        match gate.should_run(&counts, "9912345", "sturgeon-userdebug").await {
            GateDecision::Skip(reason) => assert!(reason.contains("9912345")),
            GateDecision::Run => panic!("expected skip"),
        }
    }

    #[tokio::test]
    async fn runs_below_threshold_and_records() {
        let counts = FakeCounts::with(&[("9912345", "", 2)]);
        let gate = BuildGate::new(3, GatePolicy::PerBuild);
        assert_eq!(
            gate.should_run(&counts, "9912345", "sturgeon-userdebug").await,
            GateDecision::Run
        );
        gate.record(&counts, "9912345", "sturgeon-userdebug").await;
        assert_eq!(counts.tested_count("9912345", "").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn per_flavor_counts_each_flavor_separately() {
        let counts = FakeCounts::with(&[("9912345", "sturgeon-userdebug", 5)]);
        let gate = BuildGate::new(3, GatePolicy::PerFlavor);
        match gate.should_run(&counts, "9912345", "sturgeon-userdebug").await {
            GateDecision::Skip(_) => {}
            GateDecision::Run => panic!("expected skip for the exhausted flavor"),
        }
        assert_eq!(
            gate.should_run(&counts, "9912345", "dory-userdebug").await,
            GateDecision::Run
        );
    }

    #[tokio::test]
    async fn unreachable_service_fails_open() {
        let counts = FakeCounts::down();
        let gate = BuildGate::new(3, GatePolicy::PerBuild);
        assert_eq!(
            gate.should_run(&counts, "9912345", "any").await,
            GateDecision::Run
        );
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(GatePolicy::parse("per-build").unwrap(), GatePolicy::PerBuild);
        assert_eq!(GatePolicy::parse("per-flavor").unwrap(), GatePolicy::PerFlavor);
        assert!(GatePolicy::parse("per-device").is_err());
    }

    #[tokio::test]
    async fn tcp_client_speaks_the_line_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let (reader, mut writer) = stream.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = if line.starts_with("COUNT ") {
                        "OK 2".to_string()
                    } else if line.starts_with("RECORD ") {
                        "OK".to_string()
                    } else {
                        "ERR unknown command".to_string()
                    };
                    writer
                        .write_all(format!("{reply}\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
        });

        let client = TcpCounts::new(addr, Duration::from_secs(2));
        assert_eq!(client.tested_count("9912345", "").await.unwrap(), 2);
        client.record_run("9912345", "").await.unwrap();
        let err = client.roundtrip("BOGUS").await.unwrap_err();
        assert!(matches!(err, HarnessError::Gate(_)));
    }
}
