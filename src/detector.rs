use crate::digest::Digest;
use crate::state::RunOptions;
use crate::workload::{PatchOperation, Workload, WorkloadClient, apply_patch, escape_json_pointer};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

static LAST_KNOWN_DIGEST_PREFIX: &str = "imagePoller.zero.tw/last-known-digest-";

pub fn digest_annotation_key(container_name: &str) -> String {
    format!("{}{}", LAST_KNOWN_DIGEST_PREFIX, container_name)
}

/// Write of `digest` under `key`. The annotation map is created as a whole when
/// the workload has none, since a JSON pointer needs its parent to exist.
pub fn record_digest_operation(
    annotations: &BTreeMap<String, String>,
    key: &str,
    digest: &Digest,
) -> PatchOperation {
    if annotations.is_empty() {
        PatchOperation::Add {
            path: "/metadata/annotations".to_string(),
            value: json!({ key: digest.as_str() }),
        }
    } else {
        PatchOperation::Add {
            path: format!("/metadata/annotations/{}", escape_json_pointer(key)),
            value: json!(digest.as_str()),
        }
    }
}

/// Records `digest` for `container_name` and reports whether it differs from the
/// previously recorded one. The write happens whether or not anything changed.
pub async fn detect_and_record(
    client: &impl WorkloadClient,
    workload: &mut Workload,
    container_name: &str,
    digest: &Digest,
    options: &RunOptions,
) -> anyhow::Result<bool> {
    let key = digest_annotation_key(container_name);
    let previous = workload.annotations.get(&key).cloned().unwrap_or_default();

    let operation = record_digest_operation(&workload.annotations, &key, digest);
    apply_patch(client, workload, operation, options.optimistic_concurrency).await?;
    workload
        .annotations
        .insert(key, digest.as_str().to_string());

    if previous.is_empty() && options.baseline_first_observation {
        info!(
            "No digest recorded yet for container {}, recorded {} as baseline",
            container_name, digest
        );
        return Ok(false);
    }

    let changed = previous != digest.as_str();
    if changed {
        info!(
            "Last known digest '{}' of container {} differs from {}",
            previous, container_name, digest
        );
    } else {
        info!("Container {} digest {} is unchanged", container_name, digest);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::fake::{FakeWorkloads, workload};

    fn options() -> RunOptions {
        RunOptions {
            baseline_first_observation: false,
            optimistic_concurrency: false,
            restart_annotation: "kubectl.kubernetes.io/restartedAt",
        }
    }

    fn digest(s: &str) -> Digest {
        s.parse().unwrap()
    }

    #[test]
    fn test_annotation_key() {
        assert_eq!(
            digest_annotation_key("app"),
            "imagePoller.zero.tw/last-known-digest-app"
        );
    }

    #[test]
    fn test_record_operation_targets_escaped_key() {
        let annotations = BTreeMap::from([("other".to_string(), "x".to_string())]);
        let operation = record_digest_operation(
            &annotations,
            &digest_annotation_key("app"),
            &digest("sha256:AA"),
        );
        assert_eq!(
            operation,
            PatchOperation::Add {
                path: "/metadata/annotations/imagePoller.zero.tw~1last-known-digest-app"
                    .to_string(),
                value: json!("sha256:AA"),
            }
        );
    }

    #[test]
    fn test_record_operation_creates_missing_map() {
        let operation = record_digest_operation(
            &BTreeMap::new(),
            &digest_annotation_key("app"),
            &digest("sha256:AA"),
        );
        assert_eq!(
            operation,
            PatchOperation::Add {
                path: "/metadata/annotations".to_string(),
                value: json!({"imagePoller.zero.tw/last-known-digest-app": "sha256:AA"}),
            }
        );
    }

    #[tokio::test]
    async fn test_changed_digest_is_recorded() {
        let mut web = workload("web", &[("app", "reg.local/app:prod")]);
        web.annotations
            .insert(digest_annotation_key("app"), "sha256:BB".to_string());
        let client = FakeWorkloads::with([web.clone()]);

        let changed = detect_and_record(&client, &mut web, "app", &digest("sha256:AA"), &options())
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(web.annotations[&digest_annotation_key("app")], "sha256:AA");
        let stored = client.stored("web");
        assert_eq!(stored.annotations[&digest_annotation_key("app")], "sha256:AA");
        assert_eq!(stored.annotations["deployment.kubernetes.io/revision"], "1");
    }

    #[tokio::test]
    async fn test_unchanged_digest_is_still_written() {
        let mut web = workload("web", &[("app", "reg.local/app:prod")]);
        web.annotations
            .insert(digest_annotation_key("app"), "sha256:AA".to_string());
        let client = FakeWorkloads::with([web.clone()]);

        let changed = detect_and_record(&client, &mut web, "app", &digest("sha256:AA"), &options())
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(client.patches_for("web").len(), 1);
        assert_eq!(
            client.stored("web").annotations[&digest_annotation_key("app")],
            "sha256:AA"
        );
    }

    #[tokio::test]
    async fn test_first_observation_counts_as_change() {
        let mut web = workload("web", &[("app", "reg.local/app:prod")]);
        web.annotations.clear();
        let client = FakeWorkloads::with([web.clone()]);

        let changed = detect_and_record(&client, &mut web, "app", &digest("sha256:AA"), &options())
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(
            client.stored("web").annotations[&digest_annotation_key("app")],
            "sha256:AA"
        );

        // the map exists now, so the next container is written by key
        let changed = detect_and_record(&client, &mut web, "sidecar", &digest("sha256:CC"), &options())
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(client.stored("web").annotations.len(), 2);
    }

    #[tokio::test]
    async fn test_first_observation_as_baseline() {
        let mut web = workload("web", &[("app", "reg.local/app:prod")]);
        let client = FakeWorkloads::with([web.clone()]);
        let options = RunOptions {
            baseline_first_observation: true,
            ..options()
        };

        let changed = detect_and_record(&client, &mut web, "app", &digest("sha256:AA"), &options)
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(
            client.stored("web").annotations[&digest_annotation_key("app")],
            "sha256:AA"
        );
    }

    #[tokio::test]
    async fn test_failed_write_is_an_error() {
        let mut web = workload("web", &[("app", "reg.local/app:prod")]);
        let client = FakeWorkloads::with([web.clone()]);
        client.fail_patches_at("/metadata/annotations");

        let result =
            detect_and_record(&client, &mut web, "app", &digest("sha256:AA"), &options()).await;

        assert!(result.is_err());
        assert!(!web.annotations.contains_key(&digest_annotation_key("app")));
    }
}
