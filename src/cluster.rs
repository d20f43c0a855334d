use crate::workload::{
    Container, PatchOperation, Workload, WorkloadClient, WorkloadKind, WorkloadTarget,
};
use anyhow::Context;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::{Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::info;

static IMAGE_POLLER_FIELD_MANAGER: &str = "image-poller";

pub async fn create_client(in_cluster: bool) -> anyhow::Result<Client> {
    let config = if in_cluster {
        info!("Using in-cluster Kubernetes configuration");
        kube::Config::incluster().context("Failed to load in-cluster Kubernetes configuration")?
    } else {
        info!("Using kubeconfig Kubernetes configuration");
        kube::Config::from_kubeconfig(&KubeConfigOptions::default())
            .await
            .context("Failed to load kubeconfig")?
    };

    let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
    let api_server_info = client
        .apiserver_version()
        .await
        .context("Failed to reach the Kubernetes API server")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Workload resources that manage their pods through a pod template.
pub trait PodTemplateResource
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + 'static,
{
    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    fn to_workload(&self, target: &WorkloadTarget, namespace: &str) -> Workload {
        let template = self.pod_template();
        let containers = template
            .and_then(|t| t.spec.as_ref())
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|c| Container {
                        name: c.name.clone(),
                        image: c.image.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let template_annotations = template
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();

        Workload {
            target: target.clone(),
            namespace: namespace.to_string(),
            resource_version: self.resource_version(),
            containers,
            annotations: self.annotations().clone(),
            template_annotations,
        }
    }
}

impl PodTemplateResource for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl PodTemplateResource for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl PodTemplateResource for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

/// Workloads of a single namespace, read with GET and written with JSON patches.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    namespace: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn get_as<K: PodTemplateResource>(
        &self,
        target: &WorkloadTarget,
    ) -> anyhow::Result<Workload> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        let resource = api.get(&target.name).await.with_context(|| {
            format!("Failed to get {} in namespace {}", target, self.namespace)
        })?;
        Ok(resource.to_workload(target, &self.namespace))
    }

    async fn patch_as<K: PodTemplateResource>(
        &self,
        target: &WorkloadTarget,
        operations: &[PatchOperation],
    ) -> anyhow::Result<Option<String>> {
        let patch: json_patch::Patch = serde_json::to_value(operations)
            .and_then(serde_json::from_value)
            .context("Failed to marshal JSON patch")?;

        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = PatchParams {
            field_manager: Some(IMAGE_POLLER_FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let updated = api
            .patch(&target.name, &params, &Patch::<()>::Json(patch))
            .await
            .with_context(|| format!("Failed to patch {} in namespace {}", target, self.namespace))?;
        Ok(updated.resource_version())
    }
}

impl WorkloadClient for KubeWorkloads {
    async fn get(&self, target: &WorkloadTarget) -> anyhow::Result<Workload> {
        match target.kind {
            WorkloadKind::Deployment => self.get_as::<Deployment>(target).await,
            WorkloadKind::StatefulSet => self.get_as::<StatefulSet>(target).await,
            WorkloadKind::DaemonSet => self.get_as::<DaemonSet>(target).await,
        }
    }

    async fn patch(
        &self,
        target: &WorkloadTarget,
        operations: &[PatchOperation],
    ) -> anyhow::Result<Option<String>> {
        match target.kind {
            WorkloadKind::Deployment => self.patch_as::<Deployment>(target, operations).await,
            WorkloadKind::StatefulSet => self.patch_as::<StatefulSet>(target, operations).await,
            WorkloadKind::DaemonSet => self.patch_as::<DaemonSet>(target, operations).await,
        }
    }
}
