use crate::workload::{PatchOperation, Workload, WorkloadClient, apply_patch, escape_json_pointer};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::BTreeMap;

/// Pod template write that makes the controller replace all pods. Only the
/// marker key is touched, unless the template has no annotations at all.
pub fn restart_operation(
    template_annotations: &BTreeMap<String, String>,
    restart_annotation: &str,
    now: DateTime<Utc>,
) -> PatchOperation {
    let restarted_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    if template_annotations.is_empty() {
        PatchOperation::Add {
            path: "/spec/template/metadata/annotations".to_string(),
            value: json!({ restart_annotation: restarted_at }),
        }
    } else {
        PatchOperation::Add {
            path: format!(
                "/spec/template/metadata/annotations/{}",
                escape_json_pointer(restart_annotation)
            ),
            value: json!(restarted_at),
        }
    }
}

pub async fn trigger_restart(
    client: &impl WorkloadClient,
    workload: &mut Workload,
    restart_annotation: &str,
    now: DateTime<Utc>,
    guard: bool,
) -> anyhow::Result<()> {
    let operation = restart_operation(&workload.template_annotations, restart_annotation, now);
    apply_patch(client, workload, operation, guard)
        .await
        .with_context(|| format!("Failed to patch {} to trigger rollout", workload.target))?;

    workload.template_annotations.insert(
        restart_annotation.to_string(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    Ok(())
}
