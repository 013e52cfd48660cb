//! Poll sweep: three strictly sequential passes over the cluster, most
//! detailed first, closed by a SYNC checkpoint.

use anyhow::Context;
use keeper_core::{format_object, watch_label_selector, DetailLevel, OutboundEvent};
use keeper_kubehub::{discover, KubeApi, KubeError, ListQuery, ResourceTypeDescriptor};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    cluster_config::{load_cluster_config, ResourceFilter},
    context::AgentContext,
    watch::has_instances,
};

const NAMESPACES_URI: &str = "/api/v1/namespaces";

/// Turn a list response into POLLED events. Items missing `kind` or
/// `apiVersion` inherit them from the list; `formatter` may drop an item.
pub fn create_polled_events<F>(list: &Value, formatter: F) -> Vec<OutboundEvent>
where
    F: Fn(Value) -> Option<Value>,
{
    let Some(items) = list.get("items").and_then(Value::as_array) else { return Vec::new() };
    let list_kind = list.get("kind").and_then(Value::as_str).unwrap_or_default();
    let kind = list_kind.strip_suffix("List").unwrap_or(list_kind);
    let api_version = list.get("apiVersion").cloned().unwrap_or(Value::Null);
    items
        .iter()
        .cloned()
        .filter_map(|mut item| {
            if let Some(obj) = item.as_object_mut() {
                if !obj.contains_key("kind") && !kind.is_empty() {
                    obj.insert("kind".into(), Value::String(kind.to_string()));
                }
                if !obj.contains_key("apiVersion") && !api_version.is_null() {
                    obj.insert("apiVersion".into(), api_version.clone());
                }
            }
            formatter(item).map(OutboundEvent::polled)
        })
        .collect()
}

/// Drop subresources, apply the allow/deny list, and keep only types with at
/// least one instance. Rejected probes drop the type; transport errors fail.
pub async fn trim_resources(
    api: &dyn KubeApi,
    types: Vec<ResourceTypeDescriptor>,
    filter: &ResourceFilter,
) -> Result<Vec<ResourceTypeDescriptor>, KubeError> {
    let mut kept = Vec::new();
    for d in types.into_iter().filter(|d| !d.is_subresource() && filter.permits(d)) {
        match api.list(&d.uri(), &ListQuery::default().limit(1)).await {
            Ok(list) if has_instances(&list) => kept.push(d),
            Ok(_) => {}
            Err(KubeError::Status { code, .. }) => debug!(uri = %d.uri(), code, "probe rejected; not polling"),
            Err(e) => return Err(e),
        }
    }
    Ok(kept)
}

// Pages through one collection, handing every page to `on_page`.
async fn for_each_page<F>(api: &dyn KubeApi, uri: &str, base: &ListQuery, page_size: u32, mut on_page: F) -> Result<(), KubeError>
where
    F: FnMut(&Value),
{
    let mut token: Option<String> = None;
    loop {
        let query = base.clone().limit(page_size).continue_from(token.take());
        let page = api.list(uri, &query).await?;
        on_page(&page);
        token = page.pointer("/metadata/continue").and_then(Value::as_str).filter(|c| !c.is_empty()).map(str::to_string);
        if token.is_none() {
            return Ok(());
        }
    }
}

// Lists every type under `query` and sends what `formatter` keeps. A type
// answering non-2xx is skipped; anything else fails the pass.
async fn sweep<'a, F>(ctx: &AgentContext, types: impl Iterator<Item = &'a ResourceTypeDescriptor>, query: &ListQuery, formatter: F) -> Result<(), KubeError>
where
    F: Fn(Value) -> Option<Value>,
{
    for d in types {
        let uri = d.uri();
        let result = for_each_page(ctx.kube.as_ref(), &uri, query, ctx.settings.page_size, |page| {
            let events = create_polled_events(page, &formatter);
            if !events.is_empty() {
                ctx.sender.send(events);
            }
        })
        .await;
        match result {
            Ok(()) => {}
            Err(KubeError::Status { code, message }) => warn!(uri = %uri, code, message = %message, "list rejected; skipping type"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn namespace_of(o: &Value) -> Option<&str> { o.pointer("/metadata/namespace").and_then(Value::as_str) }

async fn labelled_objects(ctx: &AgentContext, types: &[ResourceTypeDescriptor], selector: &str) -> Result<(), KubeError> {
    let query = ListQuery::default().labels(selector);
    sweep(ctx, types.iter(), &query, |o| format_object(o, DetailLevel::Lite)).await
}

async fn labelled_namespaces(ctx: &AgentContext, types: &[ResourceTypeDescriptor], selector: &str) -> Result<(), KubeError> {
    let mut namespaces: Vec<String> = Vec::new();
    let query = ListQuery::default().labels(selector);
    for_each_page(ctx.kube.as_ref(), NAMESPACES_URI, &query, ctx.settings.page_size, |page| {
        let names = page.get("items").and_then(Value::as_array).into_iter().flatten();
        namespaces.extend(names.filter_map(|ns| ns.pointer("/metadata/name").and_then(Value::as_str)).map(str::to_string));
    })
    .await?;

    for ns in &namespaces {
        debug!(namespace = %ns, "sweeping labelled namespace");
        let query = ListQuery::default().fields(format!("metadata.namespace=={}", ns));
        let in_ns = |o: Value| if namespace_of(&o) == Some(ns.as_str()) { format_object(o, DetailLevel::Lite) } else { None };
        sweep(ctx, types.iter().filter(|d| d.namespaced), &query, in_ns).await?;
    }
    Ok(())
}

async fn cluster_scoped(ctx: &AgentContext, types: &[ResourceTypeDescriptor], level: DetailLevel) -> Result<(), KubeError> {
    let scoped = |o: Value| if namespace_of(&o).is_none() { format_object(o, level) } else { None };
    sweep(ctx, types.iter().filter(|d| !d.namespaced), &ListQuery::default(), scoped).await
}

async fn run_passes(ctx: &AgentContext, types: &[ResourceTypeDescriptor], cluster_level: Option<DetailLevel>) -> anyhow::Result<()> {
    let selector = watch_label_selector();
    labelled_objects(ctx, types, &selector).await.context("polling labelled resources")?;
    labelled_namespaces(ctx, types, &selector).await.context("polling labelled namespaces")?;
    if let Some(level) = cluster_level {
        cluster_scoped(ctx, types, level).await.context("polling non-namespaced resources")?;
    }
    Ok(())
}

async fn pollable_types(ctx: &AgentContext, filter: &ResourceFilter) -> anyhow::Result<Vec<ResourceTypeDescriptor>> {
    let types = discover(ctx.kube.as_ref(), Some("get")).await.context("discovering resources supporting get")?;
    trim_resources(ctx.kube.as_ref(), types, filter).await.context("probing resources")
}

/// One poll cycle. Returns whether every pass succeeded; only then is SYNC sent.
pub async fn poll(ctx: &AgentContext) -> bool {
    info!("polling resources");
    let config = load_cluster_config(ctx.kube.as_ref(), &ctx.settings.config_namespace).await;

    let types = match pollable_types(ctx, &config.filter).await {
        Ok(types) => types,
        Err(e) => {
            ctx.reporter.error("Error querying Kubernetes resources supporting 'get' verb", &e).await;
            ctx.sender.reset();
            counter!("keeper_poll_cycles_total", 1u64, "outcome" => "failed");
            return false;
        }
    };
    debug!(uris = ?types.iter().map(|d| d.uri()).collect::<Vec<_>>(), "polling against resources");
    if types.is_empty() {
        info!("no resources to poll");
        counter!("keeper_poll_cycles_total", 1u64, "outcome" => "empty");
        return true;
    }

    match run_passes(ctx, &types, config.non_namespaced.poll).await {
        Ok(()) => {
            if let Err(e) = ctx.sender.send_poll_complete().await {
                error!(error = %e, "failed to send SYNC");
            }
            counter!("keeper_poll_cycles_total", 1u64, "outcome" => "ok");
            info!("finished polling resources");
            true
        }
        Err(e) => {
            ctx.sender.flush();
            ctx.sender.reset();
            counter!("keeper_poll_cycles_total", 1u64, "outcome" => "failed");
            ctx.reporter.error("Poll failed; not sending SYNC", &e).await;
            false
        }
    }
}
