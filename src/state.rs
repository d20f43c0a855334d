use crate::config::Config;
use crate::credentials::CredentialTable;
use crate::workload::WorkloadTarget;

/// Per-run policy derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub baseline_first_observation: bool,
    pub optimistic_concurrency: bool,
    pub restart_annotation: &'static str,
}

impl From<&Config> for RunOptions {
    fn from(config: &Config) -> Self {
        Self {
            baseline_first_observation: config.baseline_first_observation,
            optimistic_concurrency: config.optimistic_concurrency,
            restart_annotation: config.restart_annotation(),
        }
    }
}

#[derive(Clone)]
pub struct ControllerContext<W, R> {
    pub(crate) workloads: W,
    pub(crate) registry: R,
    pub(crate) checks: Vec<WorkloadTarget>,
    pub(crate) credentials: CredentialTable,
    pub(crate) options: RunOptions,
}

impl<W, R> ControllerContext<W, R> {
    pub fn new(workloads: W, registry: R, config: &Config) -> Self {
        Self {
            workloads,
            registry,
            checks: config.checks.clone(),
            credentials: config.credentials.clone(),
            options: RunOptions::from(config),
        }
    }
}

/// Counters for one pass over the configured workloads.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub workloads_processed: usize,
    pub workloads_failed: usize,
    pub containers_changed: usize,
    pub containers_unchanged: usize,
    pub containers_failed: usize,
    pub restarts_triggered: usize,
    pub restarts_failed: usize,
}
