use super::{case_name, summary, StressSuite, SuiteContext};
use crate::core::poll::PollSpec;
use crate::core::{HarnessError, Result};
use crate::pairing::PairingUtils;
use crate::report::{CaseOutcome, Metrics, RunListener, SuiteSummary};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Unpair, re-pair through the companion receiver, and verify the bond, over
/// and over.
pub struct PairingStress;

#[async_trait]
impl StressSuite for PairingStress {
    fn name(&self) -> &'static str {
        "pairing-stress"
    }

    async fn run(
        &self,
        ctx: &SuiteContext,
        listener: &mut (dyn RunListener + Send),
    ) -> Result<SuiteSummary> {
        let cfg = &ctx.plan.pairing;
        let peer = cfg
            .peer_mac
            .clone()
            .ok_or_else(|| HarnessError::Config("pairing.peer_mac is required".to_string()))?;
        let utils = PairingUtils::new(ctx.client.clone());
        let start = Instant::now();

        let iterations = ctx.plan.run.iterations;
        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut pair_total = 0f64;
        let mut pair_samples = 0u32;

        for i in 0..iterations {
            let case = case_name(i);
            match self.iteration(ctx, &utils, &peer).await {
                Ok((outcome, metrics, secs)) => {
                    if let Some(s) = secs {
                        pair_total += s;
                        pair_samples += 1;
                    }
                    if outcome.passed() {
                        passed += 1;
                    } else {
                        failed += 1;
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
        totals.put("pair_success", passed);
        if pair_samples > 0 {
            totals.put(
                "avg_pair_secs",
                format!("{:.1}", pair_total / f64::from(pair_samples)),
            );
        }
        Ok(summary(self.name(), passed, failed, 0, start, totals))
    }
}

impl PairingStress {
    async fn iteration(
        &self,
        ctx: &SuiteContext,
        utils: &PairingUtils,
        peer: &str,
    ) -> Result<(CaseOutcome, Metrics, Option<f64>)> {
        let cfg = &ctx.plan.pairing;
        let serial = &ctx.serial;
        let bond_spec = PollSpec::from_secs(cfg.bond_timeout_secs, cfg.poll_interval_secs);
        let mut metrics = Metrics::new();

        utils.clear_bonds(serial).await?;
        tokio::time::sleep(Duration::from_secs(cfg.settle_secs)).await;
        if utils.is_bonded(serial, peer).await? {
            return Ok((
                CaseOutcome::Failed("bond survived clear_bonds".to_string()),
                metrics,
                None,
            ));
        }

        info!(%peer, "starting pairing");
        let t0 = Instant::now();
        utils.start_pairing(serial, peer, &cfg.pair_action).await?;
        utils
            .accept_consent(serial, cfg.consent_taps, Duration::from_secs(cfg.tap_delay_secs))
            .await?;
        if !utils.wait_bonded(serial, peer, bond_spec).await? {
            return Ok((
                CaseOutcome::Failed(format!("no bond within {}s", cfg.bond_timeout_secs)),
                metrics,
                None,
            ));
        }
        let secs = t0.elapsed().as_secs_f64();
        metrics.put_secs("pair_secs", t0.elapsed());
        Ok((CaseOutcome::Passed, metrics, Some(secs)))
    }
}
