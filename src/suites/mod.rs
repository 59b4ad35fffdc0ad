pub mod bt_reconnect;
pub mod bt_throughput;
pub mod pairing_stress;
pub mod wifi_throughput;

use crate::adb::AdbClient;
use crate::core::config::PlanConfig;
use crate::core::Result;
use crate::report::{RunListener, SuiteSummary};
use async_trait::async_trait;
use std::path::PathBuf;

pub struct SuiteContext {
    pub client: AdbClient,
    pub serial: String,
    pub plan: PlanConfig,
    pub results_dir: PathBuf,
}

/// One stress scenario. `run` drives the device for the configured number of
/// iterations and reports each case to the listener; a device-gone error
/// aborts the remaining iterations.
#[async_trait]
pub trait StressSuite: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(
        &self,
        ctx: &SuiteContext,
        listener: &mut (dyn RunListener + Send),
    ) -> Result<SuiteSummary>;
}

pub fn suite_names() -> &'static [&'static str] {
    &["bt-reconnect", "bt-throughput", "pairing-stress", "wifi-throughput"]
}

pub fn suites_for(selector: &str) -> Option<Vec<Box<dyn StressSuite>>> {
    match selector {
        "bt-reconnect" => Some(vec![Box::new(bt_reconnect::BtReconnectStress)]),
        "bt-throughput" => Some(vec![Box::new(bt_throughput::BtThroughputStress)]),
        "pairing-stress" => Some(vec![Box::new(pairing_stress::PairingStress)]),
        "wifi-throughput" => Some(vec![Box::new(wifi_throughput::WifiThroughputStress)]),
        "all" => Some(vec![
            Box::new(bt_reconnect::BtReconnectStress),
            Box::new(bt_throughput::BtThroughputStress),
            Box::new(pairing_stress::PairingStress),
            Box::new(wifi_throughput::WifiThroughputStress),
        ]),
        _ => None,
    }
}

pub(crate) fn case_name(iteration: u32) -> String {
    format!("iter-{:03}", iteration + 1)
}

pub(crate) fn summary(
    name: &str,
    passed: u32,
    failed: u32,
    skipped: u32,
    start: std::time::Instant,
    metrics: crate::report::Metrics,
) -> SuiteSummary {
    SuiteSummary {
        suite: name.to_string(),
        passed,
        failed,
        skipped,
        elapsed_secs: start.elapsed().as_secs_f64(),
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_resolves_every_known_suite() {
        for name in suite_names() {
            let suites = suites_for(name).unwrap();
            assert_eq!(suites.len(), 1);
            assert_eq!(suites[0].name(), *name);
        }
        assert_eq!(suites_for("all").unwrap().len(), suite_names().len());
        assert!(suites_for("nope").is_none());
    }

    #[test]
    fn case_names_are_one_based() {
        assert_eq!(case_name(0), "iter-001");
        assert_eq!(case_name(41), "iter-042");
    }
}
