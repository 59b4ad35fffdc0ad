use super::{case_name, summary, StressSuite, SuiteContext};
use crate::connectivity::ConnectivityHelper;
use crate::core::poll::PollSpec;
use crate::core::{HarnessError, Result};
use crate::report::{CaseOutcome, Metrics, RunListener, SuiteSummary};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Drop the bluetooth link (radio toggle or airplane mode), wait for the
/// companion to reconnect, then prove the link end to end with a bridged
/// notification.
pub struct BtReconnectStress;

#[async_trait]
impl StressSuite for BtReconnectStress {
    fn name(&self) -> &'static str {
        "bt-reconnect"
    }

    async fn run(
        &self,
        ctx: &SuiteContext,
        listener: &mut (dyn RunListener + Send),
    ) -> Result<SuiteSummary> {
        let cfg = &ctx.plan.bt_reconnect;
        let peer = cfg
            .peer_mac
            .clone()
            .ok_or_else(|| HarnessError::Config("bt_reconnect.peer_mac is required".to_string()))?;
        let helper = ConnectivityHelper::new(ctx.client.clone());
        let start = Instant::now();

        if !helper.bluetooth_enabled(&ctx.serial).await? {
            helper.set_bluetooth(&ctx.serial, true).await?;
        }
        let reconnect_spec = PollSpec::from_secs(cfg.reconnect_timeout_secs, cfg.poll_interval_secs);
        if !helper
            .validate_connection_state(&ctx.serial, &peer, true, reconnect_spec)
            .await?
        {
            listener.case_finished(
                self.name(),
                "setup",
                &CaseOutcome::Failed(format!("peer {peer} not connected before stress")),
                &Metrics::new(),
            );
            return Ok(summary(self.name(), 0, 1, 0, start, Metrics::new()));
        }

        let iterations = ctx.plan.run.iterations;
        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut reconnect_total = 0f64;
        let mut reconnect_samples = 0u32;

        for i in 0..iterations {
            let case = case_name(i);
            match self.iteration(ctx, &helper, &peer, i).await {
                Ok((outcome, metrics, secs)) => {
                    if let Some(s) = secs {
                        reconnect_total += s;
                        reconnect_samples += 1;
                    }
                    if outcome.passed() {
                        passed += 1;
                    } else {
                        failed += 1;
                        let _ = helper
                            .capture_failure_logs(
                                &ctx.serial,
                                &ctx.results_dir,
                                &format!("{}-{case}", self.name()),
                            )
                            .await;
                    }
                    listener.case_finished(self.name(), &case, &outcome, &metrics);
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
        totals.put("reconnect_success", passed);
        if reconnect_samples > 0 {
            totals.put(
                "avg_reconnect_secs",
                format!("{:.1}", reconnect_total / f64::from(reconnect_samples)),
            );
        }
        Ok(summary(self.name(), passed, failed, 0, start, totals))
    }
}

impl BtReconnectStress {
    async fn iteration(
        &self,
        ctx: &SuiteContext,
        helper: &ConnectivityHelper,
        peer: &str,
        i: u32,
    ) -> Result<(CaseOutcome, Metrics, Option<f64>)> {
        let cfg = &ctx.plan.bt_reconnect;
        let serial = &ctx.serial;
        let disconnect_spec =
            PollSpec::from_secs(cfg.disconnect_timeout_secs, cfg.poll_interval_secs);
        let reconnect_spec =
            PollSpec::from_secs(cfg.reconnect_timeout_secs, cfg.poll_interval_secs);
        let notif_spec =
            PollSpec::from_secs(cfg.notification_timeout_secs, cfg.poll_interval_secs);

        let use_airplane = cfg.alternate_airplane && i % 2 == 1;
        let mut metrics = Metrics::new();
        metrics.put("mode", if use_airplane { "airplane" } else { "bt-toggle" });

        // start each iteration with a clean log so failure captures stay small
        let _ = ctx.client.logcat_clear(serial).await;

        info!(iteration = i + 1, airplane = use_airplane, "dropping bluetooth link");
        if use_airplane {
            helper.set_airplane_mode(serial, true).await?;
        } else {
            helper.set_bluetooth(serial, false).await?;
        }
        let dropped = helper
            .validate_connection_state(serial, peer, false, disconnect_spec)
            .await?;
        // restore the radio before judging the drop so a failed iteration
        // cannot leave it off for the next one
        if use_airplane {
            helper.set_airplane_mode(serial, false).await?;
        } else {
            helper.set_bluetooth(serial, true).await?;
        }
        if !dropped {
            return Ok((
                CaseOutcome::Failed("link never dropped after radio off".to_string()),
                metrics,
                None,
            ));
        }

        let t0 = Instant::now();
        if !helper
            .validate_connection_state(serial, peer, true, reconnect_spec)
            .await?
        {
            return Ok((
                CaseOutcome::Failed(format!("no reconnect within {}s", cfg.reconnect_timeout_secs)),
                metrics,
                None,
            ));
        }
        let secs = t0.elapsed().as_secs_f64();
        metrics.put_secs("reconnect_secs", t0.elapsed());

        // end to end: a notification posted on the companion must surface here
        let tag = format!("droidstress-{}", i + 1);
        let post_serial = cfg.companion_serial.as_deref().unwrap_or(serial);
        helper.clear_notifications(serial).await?;
        helper
            .post_notification(post_serial, &tag, "connectivity probe")
            .await?;
        if !helper
            .validate_notification_via_dumpsys(serial, &tag, notif_spec)
            .await?
        {
            return Ok((
                CaseOutcome::Failed("bridged notification did not arrive".to_string()),
                metrics,
                Some(secs),
            ));
        }
        tokio::time::sleep(Duration::from_secs(cfg.settle_secs)).await;
        Ok((CaseOutcome::Passed, metrics, Some(secs)))
    }
}
