use super::{case_name, summary, StressSuite, SuiteContext};
use crate::connectivity::throughput::ThroughputRunner;
use crate::connectivity::ConnectivityHelper;
use crate::core::poll::PollSpec;
use crate::core::{HarnessError, Result};
use crate::report::{CaseOutcome, Metrics, RunListener, SuiteSummary};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::warn;

/// Push traffic through the companion proxy and measure the rate from the
/// proxied interface's byte counters.
pub struct BtThroughputStress;

#[async_trait]
impl StressSuite for BtThroughputStress {
    fn name(&self) -> &'static str {
        "bt-throughput"
    }

    async fn run(
        &self,
        ctx: &SuiteContext,
        listener: &mut (dyn RunListener + Send),
    ) -> Result<SuiteSummary> {
        let cfg = &ctx.plan.bt_throughput;
        let helper = ConnectivityHelper::new(ctx.client.clone());
        let runner = ThroughputRunner::new(ctx.client.clone());
        let start = Instant::now();

        // the proxy must own its NAT redirect before traffic is meaningful
        match ctx.client.root(&ctx.serial).await {
            Ok(()) => {
                let spec = PollSpec::from_secs(cfg.iptable_timeout_secs, 2);
                if !helper
                    .validate_proxy_iptable(&ctx.serial, cfg.proxy_port, spec)
                    .await?
                {
                    listener.case_finished(
                        self.name(),
                        "setup",
                        &CaseOutcome::Failed(format!(
                            "no NAT redirect for port {} within {}s",
                            cfg.proxy_port, cfg.iptable_timeout_secs
                        )),
                        &Metrics::new(),
                    );
                    return Ok(summary(self.name(), 0, 1, 0, start, Metrics::new()));
                }
            }
            Err(e) if e.is_device_gone() => return Err(e),
            Err(e) => {
                warn!(error = %e, "adb root unavailable; skipping iptables precheck");
            }
        }

        let iterations = ctx.plan.run.iterations;
        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut skipped = 0u32;
        let mut rate_sum = 0f64;
        let mut rate_min = f64::MAX;
        let mut rate_samples = 0u32;

        for i in 0..iterations {
            let case = case_name(i);
            let limit = Duration::from_secs(cfg.transfer_timeout_secs);
            match runner
                .proxy_throughput(&ctx.serial, &cfg.iface, &cfg.transfer_cmd, limit)
                .await
            {
                Ok(mbps) => {
                    let mut metrics = Metrics::new();
                    metrics.put("mbps", format!("{mbps:.2}"));
                    rate_sum += mbps;
                    rate_min = rate_min.min(mbps);
                    rate_samples += 1;
                    let outcome = if mbps < cfg.floor_mbps {
                        failed += 1;
                        CaseOutcome::Failed(format!(
                            "{mbps:.2} Mbit/s below floor {:.2}",
                            cfg.floor_mbps
                        ))
                    } else {
                        passed += 1;
                        CaseOutcome::Passed
                    };
                    listener.case_finished(self.name(), &case, &outcome, &metrics);
                }
                Err(HarnessError::ToolMissing(tool)) => {
                    listener.case_finished(
                        self.name(),
                        &case,
                        &CaseOutcome::Skipped(format!("{tool} not on device")),
                        &Metrics::new(),
                    );
                    skipped += 1;
                    break;
                }
                Err(e) if e.is_device_gone() => {
                    warn!(error = %e, "device went away; aborting remaining iterations");
                    listener.case_finished(
                        self.name(),
                        &case,
                        &CaseOutcome::Failed(e.to_string()),
                        &Metrics::new(),
                    );
                    failed += 1;
                    break;
                }
                Err(e) => {
                    listener.case_finished(
                        self.name(),
                        &case,
                        &CaseOutcome::Failed(e.to_string()),
                        &Metrics::new(),
                    );
                    failed += 1;
                }
            }
        }

        let mut totals = Metrics::new();
        totals.put("iterations", iterations);
        if rate_samples > 0 {
            totals.put("avg_mbps", format!("{:.2}", rate_sum / f64::from(rate_samples)));
            totals.put("min_mbps", format!("{rate_min:.2}"));
        }
        Ok(summary(self.name(), passed, failed, skipped, start, totals))
    }
}
