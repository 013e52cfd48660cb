//! Watch validation: keep exactly the watches that have something to report.

use std::sync::Arc;

use anyhow::Context;
use keeper_core::{format_object, watch_label_selector, DetailLevel, EventKind, OutboundEvent};
use keeper_kubehub::{discover, KubeError, ListQuery, WatchEvent, WatchHandler};
use keeper_outbound::Sender;
use serde_json::Value;
use tracing::{debug, info};

use crate::{cluster_config::load_cluster_config, context::AgentContext};

/// Handler turning watch events into redacted outbound events.
pub fn watch_handler(sender: Arc<Sender>, level: DetailLevel) -> WatchHandler {
    Arc::new(move |ev: WatchEvent| {
        let Some(kind) = EventKind::from_watch_type(&ev.event_type) else { return };
        if let Some(object) = format_object(ev.object, level) {
            sender.forward(OutboundEvent { kind, object });
        }
    })
}

/// A probe result has instances when it carries items or a continuation.
pub fn has_instances(list: &Value) -> bool {
    let items = list.get("items").and_then(Value::as_array).map_or(false, |a| !a.is_empty());
    let cont = list.pointer("/metadata/continue").and_then(Value::as_str).map_or(false, |c| !c.is_empty());
    items || cont
}

/// One validation pass. Returns `false` when discovery or transport failed;
/// the failure is logged and reported.
pub async fn validate_watches(ctx: &AgentContext) -> bool {
    info!("validating watches");
    match try_validate(ctx).await {
        Ok(active) => {
            info!(active, "watch validation complete");
            true
        }
        Err(e) => {
            ctx.reporter.error("Could not validate watches", &e).await;
            false
        }
    }
}

async fn try_validate(ctx: &AgentContext) -> anyhow::Result<usize> {
    let config = load_cluster_config(ctx.kube.as_ref(), &ctx.settings.config_namespace).await;
    let types = discover(ctx.kube.as_ref(), Some("watch")).await.context("discovering watchable resources")?;
    let selector = watch_label_selector();

    for d in types.iter().filter(|d| !d.is_subresource()) {
        let uri = d.uri();
        if let Some(level) = config.non_namespaced.global_level(d) {
            ctx.watches.ensure_watch(&uri, ListQuery::default(), watch_handler(ctx.sender.clone(), level), true);
            continue;
        }
        let probe = ListQuery::default().labels(selector.clone()).limit(ctx.settings.page_size);
        match ctx.kube.list(&uri, &probe).await {
            Ok(list) if has_instances(&list) => {
                let query = ListQuery::default().labels(selector.clone());
                ctx.watches.ensure_watch(&uri, query, watch_handler(ctx.sender.clone(), DetailLevel::Lite), false);
            }
            Ok(_) => {
                if ctx.watches.remove_watch(&uri) {
                    info!(uri = %uri, "no labelled instances left; watch removed");
                }
            }
            Err(KubeError::Status { code, .. }) => debug!(uri = %uri, code, "probe rejected; skipping"),
            Err(e) => return Err(e).with_context(|| format!("probing {}", uri)),
        }
    }
    Ok(ctx.watches.len())
}
