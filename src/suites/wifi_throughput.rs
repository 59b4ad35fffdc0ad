use super::{summary, StressSuite, SuiteContext};
use crate::attenuator::{self, Attenuator};
use crate::connectivity::throughput::ThroughputRunner;
use crate::connectivity::ConnectivityHelper;
use crate::core::{HarnessError, Result};
use crate::report::{CaseOutcome, Metrics, RunListener, SuiteSummary};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Step the RF attenuator across a ramp and measure ping loss and iperf
/// throughput at each level. Without an attenuator a single baseline pass
/// runs.
pub struct WifiThroughputStress;

#[async_trait]
impl StressSuite for WifiThroughputStress {
    fn name(&self) -> &'static str {
        "wifi-throughput"
    }

    async fn run(
        &self,
        ctx: &SuiteContext,
        listener: &mut (dyn RunListener + Send),
    ) -> Result<SuiteSummary> {
        let cfg = &ctx.plan.wifi;
        let helper = ConnectivityHelper::new(ctx.client.clone());
        let runner = ThroughputRunner::new(ctx.client.clone());
        let start = Instant::now();

        if !helper.wifi_connected(&ctx.serial).await? {
            listener.case_finished(
                self.name(),
                "setup",
                &CaseOutcome::Failed("wifi not connected before stress".to_string()),
                &Metrics::new(),
            );
            return Ok(summary(self.name(), 0, 1, 0, start, Metrics::new()));
        }

        let mut atten = match &cfg.attenuator {
            Some(addr) => {
                let mut a = Attenuator::connect(addr, Duration::from_secs(10)).await?;
                let current = a.level().await?;
                info!(addr = %addr, db = current, "attenuator online");
                Some(a)
            }
            None => None,
        };
        let steps: Vec<Option<u32>> = match atten {
            Some(_) => attenuator::levels(cfg.atten_start, cfg.atten_stop, cfg.atten_step)
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None],
        };

        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut skipped = 0u32;

        for level in steps {
            let case = match level {
                Some(db) => format!("atten-{db:02}db"),
                None => "baseline".to_string(),
            };
            match self.step(ctx, &helper, &runner, atten.as_mut(), level).await {
                Ok((outcome, metrics)) => {
                    match &outcome {
                        CaseOutcome::Passed => passed += 1,
                        CaseOutcome::Skipped(_) => skipped += 1,
                        CaseOutcome::Failed(_) => {
                            failed += 1;
                            let _ = helper
                                .capture_failure_logs(
                                    &ctx.serial,
                                    &ctx.results_dir,
                                    &format!("{}-{case}", self.name()),
                                )
                                .await;
                        }
                    }
                    listener.case_finished(self.name(), &case, &outcome, &metrics);
                }
                Err(e) if e.is_device_gone() => {
                    warn!(error = %e, "device went away; aborting remaining levels");
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

        // leave the channel clean for whoever runs next
        if let Some(a) = atten.as_mut() {
            if let Err(e) = a.set_level(cfg.atten_start).await {
                warn!(error = %e, "failed to restore attenuation level");
            }
        }

        Ok(summary(self.name(), passed, failed, skipped, start, Metrics::new()))
    }
}

impl WifiThroughputStress {
    async fn step(
        &self,
        ctx: &SuiteContext,
        helper: &ConnectivityHelper,
        runner: &ThroughputRunner,
        atten: Option<&mut Attenuator>,
        level: Option<u32>,
    ) -> Result<(CaseOutcome, Metrics)> {
        let cfg = &ctx.plan.wifi;
        let mut metrics = Metrics::new();

        if let (Some(a), Some(db)) = (atten, level) {
            a.set_level(db).await?;
            tokio::time::sleep(Duration::from_secs(cfg.dwell_secs)).await;
            metrics.put("atten_db", db);
        }

        let ping_limit = Duration::from_secs(u64::from(cfg.ping_count) * 3 + 10);
        match helper
            .ping_test(&ctx.serial, &cfg.ping_host, cfg.ping_count, ping_limit)
            .await?
        {
            Some(stats) => {
                metrics.put("ping_sent", stats.transmitted);
                metrics.put("ping_loss_pct", format!("{:.0}", stats.loss_pct));
                if let Some(rtt) = stats.avg_rtt_ms {
                    metrics.put("ping_avg_rtt_ms", format!("{rtt:.1}"));
                }
                if stats.received == 0 {
                    return Ok((CaseOutcome::Failed("all pings lost".to_string()), metrics));
                }
            }
            None => {
                return Ok((
                    CaseOutcome::Failed("ping produced no summary".to_string()),
                    metrics,
                ));
            }
        }

        if let Some(server) = &cfg.iperf_server {
            match runner
                .iperf_throughput(&ctx.serial, server, cfg.iperf_secs, false)
                .await
            {
                Ok(mbps) => metrics.put("iperf_mbps", format!("{mbps:.2}")),
                Err(HarnessError::ToolMissing(tool)) => {
                    return Ok((
                        CaseOutcome::Skipped(format!("{tool} not on device")),
                        metrics,
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        Ok((CaseOutcome::Passed, metrics))
    }
}
