use crate::credentials::CredentialTable;
use crate::workload::WorkloadTarget;
use anyhow::{Context, Result, bail};
use std::env;
use std::path::PathBuf;
use tracing::info;

static DEFAULT_NAMESPACE: &str = "default";
static KUBECTL_RESTART_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
static IMAGE_POLLER_RESTART_ANNOTATION: &str = "imagePoller.zero.tw/restartedAt";

/// Everything a run needs, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub checks: Vec<WorkloadTarget>,
    pub namespace: String,
    pub credentials: CredentialTable,
    pub in_cluster: bool,
    pub insecure_registry: bool,
    pub ca_certificate_paths: Vec<PathBuf>,
    pub baseline_first_observation: bool,
    pub optimistic_concurrency: bool,
    pub enable_kubectl_annotation: bool,
    pub cron_schedule: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        info!("Loading configuration from environment");
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let checks = parse_checks(&lookup("CHECKS").context("CHECKS is not defined")?)?;

        let namespace = lookup("NAMESPACE")
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let credentials = match lookup("DOCKER_CONFIG") {
            Some(document) if !document.trim().is_empty() => {
                CredentialTable::from_docker_config(&document)
                    .context("Error occurred when parsing DOCKER_CONFIG")?
            }
            _ => CredentialTable::default(),
        };

        let ca_certificate_paths = lookup("REGISTRY_CA_CERTIFICATES")
            .map(|paths| {
                paths
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let flag = |name: &str, default: bool| -> Result<bool> {
            match lookup(name) {
                Some(value) => parse_bool(name, &value),
                None => Ok(default),
            }
        };

        Ok(Self {
            checks,
            namespace,
            credentials,
            in_cluster: lookup("ENV").as_deref() == Some("PROD"),
            insecure_registry: flag("INSECURE_REGISTRY", false)?,
            ca_certificate_paths,
            baseline_first_observation: flag("BASELINE_FIRST_OBSERVATION", false)?,
            optimistic_concurrency: flag("OPTIMISTIC_CONCURRENCY", false)?,
            enable_kubectl_annotation: flag("USE_KUBECTL_RESTART_ANNOTATION", true)?,
            cron_schedule: lookup("CRON_SCHEDULE").filter(|s| !s.trim().is_empty()),
        })
    }

    pub fn restart_annotation(&self) -> &'static str {
        match self.enable_kubectl_annotation {
            true => KUBECTL_RESTART_ANNOTATION,
            false => IMAGE_POLLER_RESTART_ANNOTATION,
        }
    }

    #[cfg(test)]
    pub fn for_checks(checks: &str) -> Self {
        Self::from_lookup(|name| (name == "CHECKS").then(|| checks.to_string()))
            .expect("valid test configuration")
    }
}

fn parse_checks(raw: &str) -> Result<Vec<WorkloadTarget>> {
    let checks = raw
        .split(',')
        .map(str::trim)
        .filter(|check| !check.is_empty())
        .map(str::parse::<WorkloadTarget>)
        .collect::<Result<Vec<WorkloadTarget>>>()?;

    if checks.is_empty() {
        bail!("CHECKS does not list any workload");
    }
    Ok(checks)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => bail!("{} must be a boolean, got '{}'", name, other),
    }
}
