#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use keeper_agent::{poll, run, tick, validate_watches, AgentContext, AgentSettings, TickPlan};
use keeper_core::{watch_label_selector, EventKind, OutboundEvent};
use keeper_kubehub::{
    mock::{api_resource, MockKube, WatchScript},
    ListQuery, WatchState,
};
use keeper_outbound::mock::{MockCollector, MockReply};
use serde_json::{json, Value};

const RW: &[&str] = &["get", "list", "watch"];
const CM_COLLECTION: &str = "/api/v1/namespaces/kube-system/configmaps";

fn context(kube: &Arc<MockKube>, collector: &Arc<MockCollector>) -> AgentContext {
    AgentContext::new(kube.clone(), collector.clone(), "c1", AgentSettings::default())
}

fn prompt_context(kube: &Arc<MockKube>, collector: &Arc<MockCollector>) -> AgentContext {
    let settings = AgentSettings { start_delay_max: Duration::ZERO, ..AgentSettings::default() };
    AgentContext::new(kube.clone(), collector.clone(), "c1", settings)
}

fn labelled(kind: &str, api_version: &str, name: &str, ns: Option<&str>, level: &str) -> Value {
    let mut meta = json!({"name": name, "labels": {"razee/watch-resource": level}});
    if let Some(ns) = ns {
        meta["namespace"] = json!(ns);
    }
    json!({"kind": kind, "apiVersion": api_version, "metadata": meta})
}

fn event_named<'a>(events: &'a [Value], name: &str) -> &'a Value {
    events.iter().find(|e| e["object"]["metadata"]["name"] == name).unwrap()
}

#[tokio::test(start_paused = true)]
async fn three_types_one_empty() {
    let kube = Arc::new(
        MockKube::new()
            .with_core(api_resource("pods", "Pod", true, RW))
            .with_core(api_resource("services", "Service", true, RW))
            .with_core(api_resource("nodes", "Node", false, RW)),
    );
    let mut pod = labelled("Pod", "v1", "web", Some("default"), "debug");
    pod["spec"] = json!({"containers": [{"name": "app", "env": [{"name": "TOKEN", "value": "plain"}]}]});
    kube.add_object("/api/v1/pods", pod);
    kube.add_object("/api/v1/nodes", labelled("Node", "v1", "n1", None, "lite"));
    kube.add_object("/api/v1/nodes", json!({"metadata": {"name": "n2"}, "spec": {"podCIDR": "10.0.0.0/24"}}));
    kube.put(CM_COLLECTION, "watch-keeper-non-namespaced", json!({"data": {"poll": "detail"}}));

    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);
    ctx.watches.ensure_watch("/api/v1/services", ListQuery::default(), Arc::new(|_| {}), false);

    assert!(validate_watches(&ctx).await);
    let mut uris = ctx.watches.uris();
    uris.sort();
    assert_eq!(uris, vec!["/api/v1/nodes".to_string(), "/api/v1/pods".to_string()]);
    assert!(ctx.watches.get_watch("/api/v1/services").is_none());

    assert!(poll(&ctx).await);
    let events = collector.resource_events();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e["type"] == "POLLED"));
    assert_eq!(collector.posts_to("clusters/c1/resources/sync"), vec![json!({"type": "SYNC", "count": 3})]);

    // debug passes through untouched, lite collapses, unlabelled cluster object uses the configured level
    assert_eq!(event_named(&events, "web")["object"]["spec"]["containers"][0]["env"][0]["value"], "plain");
    assert!(event_named(&events, "n1")["object"].get("spec").is_none());
    assert_eq!(event_named(&events, "n2")["object"]["spec"]["podCIDR"], "10.0.0.0/24");
    assert_eq!(event_named(&events, "n2")["object"]["kind"], "Node");
}

#[tokio::test(start_paused = true)]
async fn labelled_object_wins_over_namespace_sweep() {
    let kube = Arc::new(
        MockKube::new()
            .with_core(api_resource("configmaps", "ConfigMap", true, RW))
            .with_group("apps/v1", api_resource("deployments", "Deployment", true, RW)),
    );
    kube.add_object("/api/v1/namespaces", labelled("Namespace", "v1", "team", None, "lite"));
    let mut deploy = labelled("Deployment", "apps/v1", "api", Some("team"), "detail");
    deploy["spec"] = json!({"template": {"spec": {"containers": [{"env": [{"name": "PW", "value": "hunter2"}]}]}}});
    kube.add_object("/apis/apps/v1/deployments", deploy);
    kube.add_object(
        "/api/v1/configmaps",
        json!({"kind": "ConfigMap", "apiVersion": "v1", "metadata": {"name": "settings", "namespace": "team"}, "data": {"k": "v"}}),
    );
    kube.add_object(
        "/api/v1/configmaps",
        json!({"kind": "ConfigMap", "apiVersion": "v1", "metadata": {"name": "elsewhere", "namespace": "other"}, "data": {"k": "v"}}),
    );

    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);
    assert!(poll(&ctx).await);

    let events = collector.resource_events();
    assert_eq!(events.len(), 2);
    let deployment = event_named(&events, "api");
    assert_eq!(deployment["object"]["spec"]["template"]["spec"]["containers"][0]["env"][0]["value"], "REDACTED");
    let cm = event_named(&events, "settings");
    assert!(cm["object"].get("data").is_none());
    assert_eq!(collector.posts_to("clusters/c1/resources/sync"), vec![json!({"type": "SYNC", "count": 2})]);

    let namespace_queries: Vec<_> = kube
        .list_calls()
        .into_iter()
        .filter_map(|(_, q)| q.field_selector)
        .collect();
    assert!(namespace_queries.iter().all(|f| f == "metadata.namespace==team"));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_205_forces_poll() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.add_object("/api/v1/pods", labelled("Pod", "v1", "web", Some("default"), "true"));
    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);

    tick(&ctx, TickPlan::default()).await;
    assert!(collector.posts_to("clusters/c1/resources/sync").is_empty());

    collector.script("clusters/c1", vec![MockReply::Status(205)]);
    tick(&ctx, TickPlan::default()).await;
    assert_eq!(collector.posts_to("clusters/c1/resources/sync").len(), 1);
    let heartbeat = &collector.posts_to("clusters/c1")[0];
    assert_eq!(heartbeat["kube_version"]["gitVersion"], "v1.29.3");
}

#[tokio::test(start_paused = true)]
async fn failed_pass_skips_sync_and_resets_dedup() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.add_object("/api/v1/pods", labelled("Pod", "v1", "web", Some("default"), "lite"));
    kube.break_transport("/api/v1/namespaces");
    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);

    assert!(!poll(&ctx).await);
    ctx.sender.drain().await;
    assert_eq!(collector.resource_events().len(), 1);
    assert!(collector.posts_to("clusters/c1/resources/sync").is_empty());
    assert_eq!(ctx.sender.resource_count(), 0);
    let messages = collector.posts_to("clusters/c1/messages");
    assert_eq!(messages[0]["level"], "ERROR");

    kube.heal("/api/v1/namespaces");
    assert!(poll(&ctx).await);
    assert_eq!(collector.resource_events().len(), 2);
    assert_eq!(collector.posts_to("clusters/c1/resources/sync"), vec![json!({"type": "SYNC", "count": 1})]);
}

#[tokio::test(start_paused = true)]
async fn discovery_failure_fails_both_passes() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.set_discovery_down(true);
    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);

    assert!(!validate_watches(&ctx).await);
    assert!(!poll(&ctx).await);
    assert_eq!(collector.posts_to("clusters/c1/messages").len(), 2);
    assert!(collector.resource_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sync_falls_back_after_poll() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.add_object("/api/v1/pods", json!({"kind": "Pod", "apiVersion": "v1", "metadata": {"name": "web", "namespace": "default", "selfLink": "/api/v1/namespaces/default/pods/web", "labels": {"razee/watch-resource": "lite"}}}));
    let collector = Arc::new(MockCollector::new());
    collector.respond("clusters/c1/resources/sync", 404);
    let ctx = context(&kube, &collector);

    assert!(poll(&ctx).await);
    let legacy = collector.posts_to("clusters/c1/resources").into_iter().last().unwrap();
    assert_eq!(legacy, json!([{"type": "SYNC", "object": ["/api/v1/namespaces/default/pods/web"]}]));
    assert_eq!(ctx.sender.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn watch_events_are_redacted_and_forwarded() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.add_object("/api/v1/pods", labelled("Pod", "v1", "web", Some("default"), "detail"));
    let mut changed = labelled("Pod", "v1", "web", Some("default"), "detail");
    changed["spec"] = json!({"containers": [{"env": [{"name": "TOKEN", "value": "s3cret"}]}]});
    kube.script_watch("/api/v1/pods", WatchScript::FramesThenHang(vec![json!({"type": "MODIFIED", "object": changed})]));
    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);

    assert!(validate_watches(&ctx).await);
    tokio::time::sleep(Duration::from_secs(2)).await;
    ctx.sender.drain().await;

    let events = collector.resource_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "MODIFIED");
    assert_eq!(events[0]["object"]["spec"]["containers"][0]["env"][0]["value"], "REDACTED");
    assert_eq!(kube.watch_calls("/api/v1/pods"), 1);
}

#[tokio::test(start_paused = true)]
async fn clean_start_rebuilds_every_watch() {
    let kube = Arc::new(
        MockKube::new()
            .with_core(api_resource("pods", "Pod", true, RW))
            .with_core(api_resource("nodes", "Node", false, RW)),
    );
    kube.add_object("/api/v1/pods", labelled("Pod", "v1", "web", Some("default"), "lite"));
    kube.add_object("/api/v1/nodes", labelled("Node", "v1", "n1", None, "lite"));
    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);

    assert!(validate_watches(&ctx).await);
    let before: Vec<_> = ["/api/v1/pods", "/api/v1/nodes"].iter().map(|u| ctx.watches.get_watch(u).unwrap()).collect();

    tick(&ctx, TickPlan { clean_start: true, ..TickPlan::default() }).await;
    let mut uris = ctx.watches.uris();
    uris.sort();
    assert_eq!(uris, vec!["/api/v1/nodes".to_string(), "/api/v1/pods".to_string()]);
    for old in &before {
        assert_eq!(old.state(), WatchState::Removed);
    }
    let pods = ctx.watches.get_watch("/api/v1/pods").unwrap();
    let nodes = ctx.watches.get_watch("/api/v1/nodes").unwrap();
    assert_ne!(pods.id(), before[0].id());
    assert_ne!(nodes.id(), before[1].id());
    assert_eq!(collector.posts_to("clusters/c1").len(), 1);
    assert!(collector.posts_to("clusters/c1/resources/sync").is_empty());
}

#[tokio::test(start_paused = true)]
async fn global_watch_follows_non_namespaced_config() {
    let kube = Arc::new(
        MockKube::new()
            .with_core(api_resource("nodes", "Node", false, RW))
            .with_core(api_resource("persistentvolumes", "PersistentVolume", false, RW)),
    );
    kube.add_object("/api/v1/nodes", labelled("Node", "v1", "n1", None, "lite"));
    kube.add_object("/api/v1/nodes", json!({"kind": "Node", "apiVersion": "v1", "metadata": {"name": "n2"}}));
    kube.put(
        CM_COLLECTION,
        "watch-keeper-non-namespaced",
        json!({"data": {"v1_node": "detail", "v1_persistentvolumes": "lite"}}),
    );
    let collector = Arc::new(MockCollector::new());
    let ctx = context(&kube, &collector);

    assert!(validate_watches(&ctx).await);
    let global_nodes = ctx.watches.get_watch("/api/v1/nodes").unwrap();
    assert!(global_nodes.is_global());
    assert_eq!(global_nodes.query(), &ListQuery::default());
    let global_pvs = ctx.watches.get_watch("/api/v1/persistentvolumes").unwrap();
    assert!(global_pvs.is_global());

    // unchanged config leaves the global watches alone
    assert!(validate_watches(&ctx).await);
    assert_eq!(ctx.watches.get_watch("/api/v1/nodes").unwrap().id(), global_nodes.id());

    kube.put(CM_COLLECTION, "watch-keeper-non-namespaced", json!({"data": {"poll": "lite"}}));
    assert!(validate_watches(&ctx).await);

    let nodes = ctx.watches.get_watch("/api/v1/nodes").unwrap();
    assert!(!nodes.is_global());
    assert_ne!(nodes.id(), global_nodes.id());
    assert_eq!(nodes.query().label_selector, Some(watch_label_selector()));
    assert_eq!(global_nodes.state(), WatchState::Removed);
    assert!(ctx.watches.get_watch("/api/v1/persistentvolumes").is_none());
    assert_eq!(global_pvs.state(), WatchState::Removed);
}

#[tokio::test(start_paused = true)]
async fn run_reports_then_shuts_down_cleanly() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.add_object("/api/v1/pods", labelled("Pod", "v1", "web", Some("default"), "lite"));
    let collector = Arc::new(MockCollector::new());
    let ctx = prompt_context(&kube, &collector);

    let late = labelled("Pod", "v1", "late", Some("default"), "lite");
    let shutdown = async {
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(ctx.watches.get_watch("/api/v1/pods").is_some());
        ctx.sender.forward(OutboundEvent { kind: EventKind::Added, object: late });
    };
    run(&ctx, shutdown).await;

    // startup heartbeat plus one per elapsed tick
    assert_eq!(collector.posts_to("clusters/c1").len(), 3);
    assert_eq!(collector.posts_to("clusters/c1/resources/sync"), vec![json!({"type": "SYNC", "count": 1})]);
    let events = collector.resource_events();
    assert_eq!(event_named(&events, "web")["type"], "POLLED");
    assert_eq!(event_named(&events, "late")["type"], "ADDED");
    assert!(ctx.watches.is_empty());
    assert_eq!(kube.watch_calls("/api/v1/pods"), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_cycles_do_not_hold_back_heartbeats() {
    let kube = Arc::new(MockKube::new().with_core(api_resource("pods", "Pod", true, RW)));
    kube.add_object("/api/v1/pods", labelled("Pod", "v1", "web", Some("default"), "lite"));
    kube.set_list_delay("/api/v1/pods", Duration::from_secs(100));
    let collector = Arc::new(MockCollector::new());
    let ctx = prompt_context(&kube, &collector);

    run(&ctx, tokio::time::sleep(Duration::from_secs(30 * 60 + 30))).await;

    // one startup heartbeat, then a tick every minute once the first validation lands
    assert!(collector.posts_to("clusters/c1").len() >= 28);
    assert_eq!(collector.posts_to("clusters/c1/resources/sync").len(), 1);
    assert!(ctx.watches.is_empty());
}
