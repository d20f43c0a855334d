use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

static RESOURCE_VERSION_PATH: &str = "/metadata/resourceVersion";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::StatefulSet => write!(f, "StatefulSet"),
            WorkloadKind::DaemonSet => write!(f, "DaemonSet"),
        }
    }
}

/// One entry of the configured check list, e.g. `web` or `statefulset/db`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadTarget {
    pub kind: WorkloadKind,
    pub name: String,
}

impl FromStr for WorkloadTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = match s.split_once('/') {
            None => (WorkloadKind::Deployment, s),
            Some((kind, name)) => {
                let kind = match kind.to_ascii_lowercase().as_str() {
                    "deployment" | "deploy" => WorkloadKind::Deployment,
                    "statefulset" | "sts" => WorkloadKind::StatefulSet,
                    "daemonset" | "ds" => WorkloadKind::DaemonSet,
                    other => bail!("Unsupported workload kind '{}' in check '{}'", other, s),
                };
                (kind, name)
            }
        };

        if name.is_empty() {
            bail!("Check '{}' does not name a workload", s);
        }

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for WorkloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: Option<String>,
}

/// Snapshot of a workload taken at the start of its processing.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub target: WorkloadTarget,
    pub namespace: String,
    pub resource_version: Option<String>,
    pub containers: Vec<Container>,
    /// Annotations of the workload itself, where recorded digests live.
    pub annotations: BTreeMap<String, String>,
    /// Pod template annotations, where the restart marker lives.
    pub template_annotations: BTreeMap<String, String>,
}

/// A single JSON patch (RFC 6902) operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Test { path: String, value: Value },
}

/// Escapes an object key for use as a JSON pointer (RFC 6901) reference token.
pub fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Access to the workloads of one namespace.
pub trait WorkloadClient {
    async fn get(&self, target: &WorkloadTarget) -> Result<Workload>;

    /// Applies all operations atomically and returns the new resource version.
    async fn patch(
        &self,
        target: &WorkloadTarget,
        operations: &[PatchOperation],
    ) -> Result<Option<String>>;
}

/// Sends `operation` as its own patch. With `guard`, the patch is prefixed by a
/// test of the last observed resource version so a concurrent writer makes it fail.
pub async fn apply_patch(
    client: &impl WorkloadClient,
    workload: &mut Workload,
    operation: PatchOperation,
    guard: bool,
) -> Result<()> {
    let mut operations = Vec::with_capacity(2);
    if guard {
        let Some(resource_version) = &workload.resource_version else {
            bail!(
                "Cannot guard the patch of {} in namespace {}: no resource version was observed",
                workload.target,
                workload.namespace
            );
        };
        operations.push(PatchOperation::Test {
            path: RESOURCE_VERSION_PATH.to_string(),
            value: json!(resource_version),
        });
    }
    operations.push(operation);

    debug!(
        "Patching {} in namespace {} with patch {:?}",
        workload.target, workload.namespace, operations
    );
    if let Some(resource_version) = client.patch(&workload.target, &operations).await? {
        workload.resource_version = Some(resource_version);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory namespace that applies `add` and `test` operations the way the
    /// API server would for the paths this crate uses.
    #[derive(Default)]
    pub struct FakeWorkloads {
        pub workloads: Mutex<HashMap<String, Workload>>,
        pub patches: Mutex<Vec<(String, Vec<PatchOperation>)>>,
        pub failing_patches: Mutex<Vec<String>>,
    }

    impl FakeWorkloads {
        pub fn with(workloads: impl IntoIterator<Item = Workload>) -> Self {
            let fake = FakeWorkloads::default();
            for workload in workloads {
                fake.insert(workload);
            }
            fake
        }

        pub fn insert(&self, workload: Workload) {
            self.workloads
                .lock()
                .unwrap()
                .insert(workload.target.name.clone(), workload);
        }

        pub fn stored(&self, name: &str) -> Workload {
            self.workloads.lock().unwrap()[name].clone()
        }

        pub fn patches_for(&self, name: &str) -> Vec<Vec<PatchOperation>> {
            self.patches
                .lock()
                .unwrap()
                .iter()
                .filter(|(target, _)| target == name)
                .map(|(_, operations)| operations.clone())
                .collect()
        }

        /// Makes every patch whose path starts with `prefix` fail.
        pub fn fail_patches_at(&self, prefix: &str) {
            self.failing_patches.lock().unwrap().push(prefix.to_string());
        }
    }

    fn unescape(token: &str) -> String {
        token.replace("~1", "/").replace("~0", "~")
    }

    fn value_map(value: &Value) -> BTreeMap<String, String> {
        value
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    impl WorkloadClient for FakeWorkloads {
        async fn get(&self, target: &WorkloadTarget) -> Result<Workload> {
            match self.workloads.lock().unwrap().get(&target.name) {
                Some(workload) => Ok(workload.clone()),
                None => bail!("{} not found", target),
            }
        }

        async fn patch(
            &self,
            target: &WorkloadTarget,
            operations: &[PatchOperation],
        ) -> Result<Option<String>> {
            self.patches
                .lock()
                .unwrap()
                .push((target.name.clone(), operations.to_vec()));

            let mut workloads = self.workloads.lock().unwrap();
            let Some(stored) = workloads.get(&target.name) else {
                bail!("{} not found", target);
            };
            let mut workload = stored.clone();

            for operation in operations {
                match operation {
                    PatchOperation::Test { path, value } => {
                        assert_eq!(path, RESOURCE_VERSION_PATH);
                        if workload.resource_version.as_deref() != value.as_str() {
                            bail!("Conflict: resource version changed");
                        }
                    }
                    PatchOperation::Add { path, value } => {
                        let failing = self.failing_patches.lock().unwrap();
                        if failing.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                            bail!("Patch rejected at {}", path);
                        }
                        if path == "/metadata/annotations" {
                            workload.annotations = value_map(value);
                        } else if path == "/spec/template/metadata/annotations" {
                            workload.template_annotations = value_map(value);
                        } else if let Some(key) = path.strip_prefix("/metadata/annotations/") {
                            if workload.annotations.is_empty() {
                                bail!("Parent /metadata/annotations does not exist");
                            }
                            let value = value.as_str().unwrap_or_default().to_string();
                            workload.annotations.insert(unescape(key), value);
                        } else if let Some(key) =
                            path.strip_prefix("/spec/template/metadata/annotations/")
                        {
                            if workload.template_annotations.is_empty() {
                                bail!("Parent /spec/template/metadata/annotations does not exist");
                            }
                            let value = value.as_str().unwrap_or_default().to_string();
                            workload.template_annotations.insert(unescape(key), value);
                        } else {
                            bail!("Unexpected patch path {}", path);
                        }
                    }
                }
            }

            let next_version = workload
                .resource_version
                .as_deref()
                .and_then(|version| version.parse::<u64>().ok())
                .map(|version| (version + 1).to_string());
            workload.resource_version = next_version.clone();
            workloads.insert(target.name.clone(), workload);
            Ok(next_version)
        }
    }

    pub fn workload(name: &str, containers: &[(&str, &str)]) -> Workload {
        Workload {
            target: WorkloadTarget {
                kind: WorkloadKind::Deployment,
                name: name.to_string(),
            },
            namespace: "default".to_string(),
            resource_version: Some("1".to_string()),
            containers: containers
                .iter()
                .map(|(name, image)| Container {
                    name: name.to_string(),
                    image: Some(image.to_string()),
                })
                .collect(),
            annotations: BTreeMap::from([(
                "deployment.kubernetes.io/revision".to_string(),
                "1".to_string(),
            )]),
            template_annotations: BTreeMap::new(),
        }
    }
}
