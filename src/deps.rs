//! Dependency graph maintenance.
//!
//! A dedicated graph unit holds a Terraform state whose resources of the
//! configured type are edges between units:
//!
//! ```json
//! {"type": "statebridge_dependency", "instances": [{"attributes": {
//!     "from_unit_id": "net", "from_output": "vpc_id", "to_unit_id": "app",
//!     "in_digest": "...", "out_digest": "...", "status": "ok",
//!     "last_in_at": "...", "last_out_at": "..."}}]}
//! ```
//!
//! After a write to unit U, edges leaving U get a fresh digest of the named
//! output (`in_digest`), and edges entering U acknowledge the digest they
//! were last fed (`out_digest`). An edge is `ok` when the two agree,
//! `pending` when the source moved on, `unknown` when the output is gone.
//! An output entry without a `value` digests as `null`.
//!
//! The graph is a derived cache: every failure here is logged and counted,
//! never reported to the writer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::DepsConfig;
use crate::metrics::record_graph_refresh;
use crate::storage::backend::{LockInfo, StoreError, UnitStore};

pub const STATUS_OK: &str = "ok";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_UNKNOWN: &str = "unknown";

const GRAPH_LOCK_OWNER: &str = "statebridge-deps";

/// What a refresh did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing was read or written; the reason is for logs.
    Skipped(&'static str),
    /// The graph was read but no edge changed.
    Unchanged,
    /// The graph was rewritten with this many edges changed.
    Updated(usize),
    Failed(String),
}

impl RefreshOutcome {
    fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Skipped(_) => "skipped",
            RefreshOutcome::Unchanged => "unchanged",
            RefreshOutcome::Updated(_) => "updated",
            RefreshOutcome::Failed(_) => "failed",
        }
    }
}

pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = RefreshOutcome> + Send + 'a>>;

/// Recomputes derived graph data after a unit's state changed.
pub trait GraphUpdater: Send + Sync + 'static {
    fn update<'a>(&'a self, store: &'a dyn UnitStore, unit_id: &'a str, state: &'a [u8]) -> RefreshFuture<'a>;
}

/// Canonical form of a unit id as written in edge attributes.
pub fn normalize_unit_id(id: &str) -> &str {
    let id = id.trim().trim_matches('/');
    id.strip_suffix("/terraform.tfstate").unwrap_or(id)
}

/// SHA-256 over the value's canonical JSON (object keys sorted), base64url.
pub fn digest_value(value: &Value) -> String {
    // serde_json's default map is ordered by key, so this is canonical.
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(Sha256::digest(&canonical))
}

fn attr_str<'a>(attrs: &'a Map<String, Value>, name: &str) -> &'a str {
    attrs.get(name).and_then(Value::as_str).unwrap_or("")
}

/// Mutable views of every edge's attribute object.
fn edges_mut<'a>(
    graph: &'a mut Value,
    resource_type: &'a str,
) -> impl Iterator<Item = &'a mut Map<String, Value>> + 'a {
    graph
        .get_mut("resources")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter(move |r| r.get("type").and_then(Value::as_str) == Some(resource_type))
        .filter_map(|r| r.get_mut("instances").and_then(Value::as_array_mut))
        .flatten()
        .filter_map(|i| i.get_mut("attributes").and_then(Value::as_object_mut))
}

fn edges<'a>(graph: &'a Value, resource_type: &'a str) -> impl Iterator<Item = &'a Map<String, Value>> + 'a {
    graph
        .get("resources")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(move |r| r.get("type").and_then(Value::as_str) == Some(resource_type))
        .filter_map(|r| r.get("instances").and_then(Value::as_array))
        .flatten()
        .filter_map(|i| i.get("attributes").and_then(Value::as_object))
}

fn set_str(attrs: &mut Map<String, Value>, name: &str, value: &str) {
    attrs.insert(name.to_string(), Value::String(value.to_string()));
}

/// Apply a write of `new_state` to `unit_id` to the graph document.
///
/// Returns how many edges changed. The caller bumps `serial` and persists
/// when that is non-zero.
pub fn apply_write(graph: &mut Value, resource_type: &str, unit_id: &str, new_state: &[u8], now: &str) -> usize {
    let unit = normalize_unit_id(unit_id);
    let outputs: Option<Map<String, Value>> = serde_json::from_slice::<Value>(new_state)
        .ok()
        .and_then(|v| v.get("outputs").and_then(Value::as_object).cloned());

    let mut changed = 0;
    for attrs in edges_mut(graph, resource_type) {
        let mut edge_changed = false;
        let status = attr_str(attrs, "status").to_string();

        if normalize_unit_id(attr_str(attrs, "from_unit_id")) == unit {
            let output = outputs
                .as_ref()
                .and_then(|o| o.get(attr_str(attrs, "from_output")))
                .map(|o| o.get("value").cloned().unwrap_or(Value::Null));
            let new_status = match output {
                Some(value) => {
                    let digest = digest_value(&value);
                    if attr_str(attrs, "in_digest") != digest {
                        set_str(attrs, "in_digest", &digest);
                        set_str(attrs, "last_in_at", now);
                        edge_changed = true;
                    }
                    if attr_str(attrs, "out_digest") == digest {
                        STATUS_OK
                    } else {
                        STATUS_PENDING
                    }
                }
                None => STATUS_UNKNOWN,
            };
            if status != new_status {
                set_str(attrs, "status", new_status);
                edge_changed = true;
            }
        }

        if normalize_unit_id(attr_str(attrs, "to_unit_id")) == unit {
            let in_digest = attr_str(attrs, "in_digest").to_string();
            if !in_digest.is_empty() {
                if attr_str(attrs, "out_digest") != in_digest {
                    set_str(attrs, "out_digest", &in_digest);
                    set_str(attrs, "last_out_at", now);
                    edge_changed = true;
                }
                if attr_str(attrs, "status") != STATUS_OK {
                    set_str(attrs, "status", STATUS_OK);
                    edge_changed = true;
                }
            }
        }

        if edge_changed {
            changed += 1;
        }
    }
    changed
}

fn bump_serial(graph: &mut Value) {
    if let Some(obj) = graph.as_object_mut() {
        let serial = obj.get("serial").and_then(Value::as_i64).unwrap_or(0);
        obj.insert("serial".to_string(), Value::from(serial + 1));
    }
}

/// Graph updater backed by a unit in the same store.
#[derive(Debug, Clone)]
pub struct DependencyGraphUpdater {
    graph_unit_id: String,
    resource_type: String,
}

impl DependencyGraphUpdater {
    pub fn new(graph_unit_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            graph_unit_id: graph_unit_id.into(),
            resource_type: resource_type.into(),
        }
    }

    pub fn from_config(config: &DepsConfig) -> Self {
        Self::new(&config.graph_unit_id, &config.resource_type)
    }

    pub fn graph_unit_id(&self) -> &str {
        &self.graph_unit_id
    }

    async fn refresh_locked(&self, store: &dyn UnitStore, lock_id: &str, unit_id: &str, state: &[u8]) -> RefreshOutcome {
        let raw = match store.download(&self.graph_unit_id).await {
            Ok(raw) if !raw.is_empty() => raw,
            Ok(_) => return RefreshOutcome::Skipped("graph is empty"),
            Err(e) => return RefreshOutcome::Failed(format!("read graph: {e}")),
        };
        let mut graph: Value = match serde_json::from_slice(&raw) {
            Ok(graph) => graph,
            Err(e) => return RefreshOutcome::Failed(format!("parse graph: {e}")),
        };

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let changed = apply_write(&mut graph, &self.resource_type, unit_id, state, &now);
        if changed == 0 {
            return RefreshOutcome::Unchanged;
        }
        bump_serial(&mut graph);

        let encoded = match serde_json::to_vec(&graph) {
            Ok(encoded) => encoded,
            Err(e) => return RefreshOutcome::Failed(format!("encode graph: {e}")),
        };
        match store
            .upload(&self.graph_unit_id, Bytes::from(encoded), Some(lock_id))
            .await
        {
            Ok(()) => RefreshOutcome::Updated(changed),
            Err(e) => RefreshOutcome::Failed(format!("write graph: {e}")),
        }
    }
}

impl GraphUpdater for DependencyGraphUpdater {
    fn update<'a>(&'a self, store: &'a dyn UnitStore, unit_id: &'a str, state: &'a [u8]) -> RefreshFuture<'a> {
        Box::pin(async move {
            if normalize_unit_id(unit_id) == normalize_unit_id(&self.graph_unit_id) {
                return RefreshOutcome::Skipped("write to the graph itself");
            }
            let lock = LockInfo {
                id: format!("deps-{}", uuid::Uuid::new_v4()),
                operation: Some("DependencyRefresh".to_string()),
                info: None,
                who: GRAPH_LOCK_OWNER.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                created: Utc::now(),
                path: None,
            };
            match store.lock(&self.graph_unit_id, &lock).await {
                Ok(()) => {}
                Err(StoreError::NotFound) => return RefreshOutcome::Skipped("no graph unit"),
                Err(StoreError::LockConflict) => return RefreshOutcome::Skipped("graph is locked"),
                Err(e) => return RefreshOutcome::Failed(format!("lock graph: {e}")),
            }

            let outcome = self.refresh_locked(store, &lock.id, unit_id, state).await;

            if let Err(e) = store.unlock(&self.graph_unit_id, &lock.id).await {
                warn!(graph = %self.graph_unit_id, error = %e, "failed to release graph lock");
            }
            outcome
        })
    }
}

// -- Unit status --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingEdge {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub edge_id: String,
    pub from_unit_id: String,
    pub from_output: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub in_digest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub out_digest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_in_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_out_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub incoming_ok: usize,
    pub incoming_pending: usize,
    pub incoming_unknown: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub unit_id: String,
    /// `green`, `yellow` or `red`.
    pub status: &'static str,
    pub incoming: Vec<IncomingEdge>,
    pub summary: StatusSummary,
}

fn status_rank(status: &str) -> u8 {
    match status {
        STATUS_PENDING => 0,
        STATUS_OK => 2,
        _ => 1,
    }
}

/// Dependency status of `unit_id` according to `graph`.
///
/// A unit is red when one of its incoming edges is pending, yellow when it
/// is reachable along edges from a red unit, green otherwise.
pub fn unit_status(graph: Option<&Value>, resource_type: &str, unit_id: &str) -> UnitStatus {
    let target = normalize_unit_id(unit_id);
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut red: HashSet<&str> = HashSet::new();
    let mut incoming = Vec::new();

    for attrs in graph.into_iter().flat_map(|g| edges(g, resource_type)) {
        let from = normalize_unit_id(attr_str(attrs, "from_unit_id"));
        let to = normalize_unit_id(attr_str(attrs, "to_unit_id"));
        let status = attr_str(attrs, "status");
        adjacency.entry(from).or_default().push(to);
        if status == STATUS_PENDING {
            red.insert(to);
        }
        if to == target {
            incoming.push(IncomingEdge {
                edge_id: attr_str(attrs, "id").to_string(),
                from_unit_id: from.to_string(),
                from_output: attr_str(attrs, "from_output").to_string(),
                status: status.to_string(),
                in_digest: attr_str(attrs, "in_digest").to_string(),
                out_digest: attr_str(attrs, "out_digest").to_string(),
                last_in_at: attr_str(attrs, "last_in_at").to_string(),
                last_out_at: attr_str(attrs, "last_out_at").to_string(),
            });
        }
    }

    let mut seen: HashSet<&str> = red.iter().copied().collect();
    let mut queue: VecDeque<&str> = red.iter().copied().collect();
    let mut yellow: HashSet<&str> = HashSet::new();
    while let Some(current) = queue.pop_front() {
        for &next in adjacency.get(current).into_iter().flatten() {
            if seen.insert(next) {
                yellow.insert(next);
                queue.push_back(next);
            }
        }
    }

    let mut summary = StatusSummary::default();
    for edge in &incoming {
        match edge.status.as_str() {
            STATUS_OK => summary.incoming_ok += 1,
            STATUS_PENDING => summary.incoming_pending += 1,
            _ => summary.incoming_unknown += 1,
        }
    }
    incoming.sort_by(|a, b| {
        status_rank(&a.status)
            .cmp(&status_rank(&b.status))
            .then_with(|| a.from_unit_id.cmp(&b.from_unit_id))
    });

    let status = if red.contains(target) {
        "red"
    } else if yellow.contains(target) {
        "yellow"
    } else {
        "green"
    };

    UnitStatus {
        unit_id: unit_id.to_string(),
        status,
        incoming,
        summary,
    }
}

/// Read the graph unit and compute `unit_id`'s status. A missing or
/// unreadable graph has no edges.
pub async fn compute_unit_status(store: &dyn UnitStore, config: &DepsConfig, unit_id: &str) -> UnitStatus {
    let graph = match store.download(&config.graph_unit_id).await {
        Ok(raw) if !raw.is_empty() => serde_json::from_slice::<Value>(&raw).ok(),
        _ => None,
    };
    unit_status(graph.as_ref(), &config.resource_type, unit_id)
}

// -- Refresh queue ------------------------------------------------------------

struct QueueShared {
    /// Pending jobs in arrival order, at most one per unit.
    pending: Mutex<VecDeque<(String, Bytes)>>,
    notify: Notify,
    closed: AtomicBool,
    max_pending: usize,
}

/// Bounded background queue feeding a [`GraphUpdater`].
///
/// A newer write for a unit replaces its pending job. One worker task
/// drains the queue; dropping the queue stops it after the current job.
pub struct RefreshQueue {
    shared: Arc<QueueShared>,
}

impl RefreshQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(store: Arc<dyn UnitStore>, updater: Arc<dyn GraphUpdater>, max_pending: usize) -> Self {
        let shared = Arc::new(QueueShared {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            max_pending: max_pending.max(1),
        });
        tokio::spawn(run_worker(Arc::clone(&shared), store, updater));
        Self { shared }
    }

    /// Queue a refresh for `unit_id` with its newly written state.
    pub fn submit(&self, unit_id: &str, state: Bytes) {
        let Ok(mut pending) = self.shared.pending.lock() else {
            warn!(unit = unit_id, "refresh queue poisoned; dropping refresh");
            return;
        };
        if let Some(slot) = pending.iter_mut().find(|(id, _)| id == unit_id) {
            slot.1 = state;
            debug!(unit = unit_id, "coalesced pending graph refresh");
        } else if pending.len() >= self.shared.max_pending {
            warn!(unit = unit_id, pending = pending.len(), "refresh queue full; dropping refresh");
            record_graph_refresh("dropped");
            return;
        } else {
            pending.push_back((unit_id.to_string(), state));
        }
        drop(pending);
        self.shared.notify.notify_one();
    }

    /// Number of units waiting for a refresh.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Drop for RefreshQueue {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

async fn run_worker(shared: Arc<QueueShared>, store: Arc<dyn UnitStore>, updater: Arc<dyn GraphUpdater>) {
    loop {
        let job = shared.pending.lock().ok().and_then(|mut p| p.pop_front());
        match job {
            Some((unit_id, state)) => {
                let outcome = updater.update(store.as_ref(), &unit_id, &state).await;
                record_graph_refresh(outcome.label());
                match &outcome {
                    RefreshOutcome::Updated(edges) => {
                        info!(unit = %unit_id, edges, "dependency graph updated")
                    }
                    RefreshOutcome::Failed(reason) => {
                        warn!(unit = %unit_id, reason = %reason, "dependency graph refresh failed")
                    }
                    RefreshOutcome::Skipped(reason) => {
                        debug!(unit = %unit_id, reason, "dependency graph refresh skipped")
                    }
                    RefreshOutcome::Unchanged => {}
                }
            }
            None => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.notify.notified().await;
            }
        }
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
    }
    debug!("refresh worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::contract::lock_info;
    use crate::storage::memory::MemoryUnitStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const EDGE: &str = "statebridge_dependency";
    const NOW: &str = "2026-03-01T00:00:00Z";

    fn edge(from: &str, output: &str, to: &str) -> Value {
        json!({
            "mode": "managed",
            "type": EDGE,
            "name": format!("{from}_{to}"),
            "instances": [{"attributes": {
                "id": format!("{from}->{to}"),
                "from_unit_id": from,
                "from_output": output,
                "to_unit_id": to,
            }}]
        })
    }

    fn graph(edges: Vec<Value>) -> Value {
        json!({"version": 4, "serial": 7, "lineage": "abc", "resources": edges})
    }

    fn attrs(graph: &Value, index: usize) -> &Map<String, Value> {
        graph["resources"][index]["instances"][0]["attributes"]
            .as_object()
            .unwrap()
    }

    fn state_with_output(name: &str, value: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"version": 4, "outputs": {name: {"value": value}}})).unwrap()
    }

    // ── helpers ──

    #[test]
    fn test_normalize_unit_id() {
        assert_eq!(normalize_unit_id(" /org/app/ "), "org/app");
        assert_eq!(normalize_unit_id("org/app/terraform.tfstate"), "org/app");
        assert_eq!(normalize_unit_id("app"), "app");
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":[1,2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#).unwrap();
        assert_eq!(digest_value(&a), digest_value(&b));
        assert_ne!(digest_value(&a), digest_value(&json!({"a": [2, 1], "b": 1})));
        assert_eq!(digest_value(&a).len(), 43);
    }

    // ── apply_write ──

    #[test]
    fn test_source_write_marks_edge_pending() {
        let mut g = graph(vec![edge("net", "vpc_id", "app")]);
        let changed = apply_write(&mut g, EDGE, "net", &state_with_output("vpc_id", json!("vpc-1")), NOW);
        assert_eq!(changed, 1);
        let a = attrs(&g, 0);
        assert_eq!(a["in_digest"], json!(digest_value(&json!("vpc-1"))));
        assert_eq!(a["last_in_at"], json!(NOW));
        assert_eq!(a["status"], json!(STATUS_PENDING));
    }

    #[test]
    fn test_target_write_acknowledges() {
        let mut g = graph(vec![edge("net", "vpc_id", "app")]);
        apply_write(&mut g, EDGE, "net", &state_with_output("vpc_id", json!("vpc-1")), NOW);
        let changed = apply_write(&mut g, EDGE, "app/terraform.tfstate", b"{}", NOW);
        assert_eq!(changed, 1);
        let a = attrs(&g, 0);
        assert_eq!(a["out_digest"], a["in_digest"]);
        assert_eq!(a["status"], json!(STATUS_OK));

        // Same source value again: nothing moves.
        let changed = apply_write(&mut g, EDGE, "net", &state_with_output("vpc_id", json!("vpc-1")), NOW);
        assert_eq!(changed, 0);
        assert_eq!(attrs(&g, 0)["status"], json!(STATUS_OK));
    }

    #[test]
    fn test_missing_output_is_unknown() {
        let mut g = graph(vec![edge("net", "vpc_id", "app")]);
        assert_eq!(apply_write(&mut g, EDGE, "net", &state_with_output("other", json!(1)), NOW), 1);
        assert_eq!(attrs(&g, 0)["status"], json!(STATUS_UNKNOWN));

        let mut g = graph(vec![edge("net", "vpc_id", "app")]);
        assert_eq!(apply_write(&mut g, EDGE, "net", b"not json", NOW), 1);
        assert_eq!(attrs(&g, 0)["status"], json!(STATUS_UNKNOWN));
    }

    #[test]
    fn test_output_without_value_digests_null() {
        let mut g = graph(vec![edge("net", "vpc_id", "app")]);
        let state = br#"{"version": 4, "outputs": {"vpc_id": {"sensitive": false}}}"#;
        assert_eq!(apply_write(&mut g, EDGE, "net", state, NOW), 1);
        let a = attrs(&g, 0);
        assert_eq!(a["in_digest"], json!(digest_value(&Value::Null)));
        assert_eq!(a["status"], json!(STATUS_PENDING));
    }

    #[test]
    fn test_unrelated_resources_untouched() {
        let mut other = edge("net", "vpc_id", "app");
        other["type"] = json!("null_resource");
        let mut g = graph(vec![other.clone(), edge("db", "dsn", "app")]);
        assert_eq!(apply_write(&mut g, EDGE, "net", &state_with_output("vpc_id", json!("x")), NOW), 0);
        assert_eq!(g["resources"][0], other);
    }

    #[test]
    fn test_bump_serial_keeps_unknown_fields() {
        let mut g = graph(vec![]);
        g["terraform_version"] = json!("1.7.5");
        bump_serial(&mut g);
        assert_eq!(g["serial"], json!(8));
        assert_eq!(g["terraform_version"], json!("1.7.5"));
        assert_eq!(g["lineage"], json!("abc"));
    }

    // ── DependencyGraphUpdater ──

    async fn store_with_graph(g: &Value) -> MemoryUnitStore {
        let store = MemoryUnitStore::new();
        store.create("__graph").await.unwrap();
        store
            .upload("__graph", Bytes::from(serde_json::to_vec(g).unwrap()), None)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_updater_rewrites_graph_and_releases_lock() {
        let store = store_with_graph(&graph(vec![edge("net", "vpc_id", "app")])).await;
        let updater = DependencyGraphUpdater::new("__graph", EDGE);

        let outcome = updater
            .update(&store, "net", &state_with_output("vpc_id", json!("vpc-1")))
            .await;
        assert_eq!(outcome, RefreshOutcome::Updated(1));

        let stored: Value = serde_json::from_slice(&store.download("__graph").await.unwrap()).unwrap();
        assert_eq!(stored["serial"], json!(8));
        assert_eq!(attrs(&stored, 0)["status"], json!(STATUS_PENDING));
        assert!(store.get_lock("__graph").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_updater_unchanged_keeps_serial() {
        let store = store_with_graph(&graph(vec![edge("net", "vpc_id", "app")])).await;
        let updater = DependencyGraphUpdater::new("__graph", EDGE);
        assert_eq!(updater.update(&store, "elsewhere", b"{}").await, RefreshOutcome::Unchanged);
        let stored: Value = serde_json::from_slice(&store.download("__graph").await.unwrap()).unwrap();
        assert_eq!(stored["serial"], json!(7));
    }

    #[tokio::test]
    async fn test_updater_skips_missing_or_locked_graph() {
        let updater = DependencyGraphUpdater::new("__graph", EDGE);
        let empty = MemoryUnitStore::new();
        assert!(matches!(
            updater.update(&empty, "net", b"{}").await,
            RefreshOutcome::Skipped(_)
        ));

        let store = store_with_graph(&graph(vec![edge("net", "vpc_id", "app")])).await;
        store.lock("__graph", &lock_info("operator")).await.unwrap();
        assert!(matches!(
            updater.update(&store, "net", &state_with_output("vpc_id", json!(1))).await,
            RefreshOutcome::Skipped(_)
        ));
        assert_eq!(store.get_lock("__graph").await.unwrap().unwrap().id, "operator");
    }

    #[tokio::test]
    async fn test_updater_ignores_writes_to_graph() {
        let store = store_with_graph(&graph(vec![])).await;
        let updater = DependencyGraphUpdater::new("__graph", EDGE);
        assert!(matches!(
            updater.update(&store, "__graph", b"{}").await,
            RefreshOutcome::Skipped(_)
        ));
    }

    // ── unit_status ──

    #[test]
    fn test_unit_status_colors() {
        let mut pending = edge("net", "vpc_id", "app");
        pending["instances"][0]["attributes"]["status"] = json!(STATUS_PENDING);
        let mut ok = edge("db", "dsn", "app");
        ok["instances"][0]["attributes"]["status"] = json!(STATUS_OK);
        let mut downstream = edge("app", "url", "web");
        downstream["instances"][0]["attributes"]["status"] = json!(STATUS_OK);
        let g = graph(vec![ok, pending, downstream]);

        let app = unit_status(Some(&g), EDGE, "app");
        assert_eq!(app.status, "red");
        assert_eq!(app.incoming.len(), 2);
        assert_eq!(app.incoming[0].from_unit_id, "net");
        assert_eq!(app.incoming[1].from_unit_id, "db");
        assert_eq!(
            app.summary,
            StatusSummary {
                incoming_ok: 1,
                incoming_pending: 1,
                incoming_unknown: 0
            }
        );

        assert_eq!(unit_status(Some(&g), EDGE, "web").status, "yellow");
        assert_eq!(unit_status(Some(&g), EDGE, "net").status, "green");
        assert_eq!(unit_status(None, EDGE, "app").status, "green");
    }

    // ── RefreshQueue ──

    struct RecordingUpdater {
        seen: mpsc::UnboundedSender<(String, Vec<u8>)>,
    }

    impl GraphUpdater for RecordingUpdater {
        fn update<'a>(&'a self, _store: &'a dyn UnitStore, unit_id: &'a str, state: &'a [u8]) -> RefreshFuture<'a> {
            Box::pin(async move {
                let _ = self.seen.send((unit_id.to_string(), state.to_vec()));
                RefreshOutcome::Unchanged
            })
        }
    }

    #[tokio::test]
    async fn test_queue_delivers_jobs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = RefreshQueue::start(
            Arc::new(MemoryUnitStore::new()),
            Arc::new(RecordingUpdater { seen: tx }),
            8,
        );
        queue.submit("net", Bytes::from_static(b"v1"));
        let (unit, state) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unit, "net");
        assert_eq!(state, b"v1");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_queue_coalesces_and_bounds() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = RefreshQueue::start(
            Arc::new(MemoryUnitStore::new()),
            Arc::new(RecordingUpdater { seen: tx }),
            2,
        );
        // The worker cannot run until this task yields.
        queue.submit("a", Bytes::from_static(b"a1"));
        queue.submit("a", Bytes::from_static(b"a2"));
        queue.submit("b", Bytes::from_static(b"b1"));
        queue.submit("c", Bytes::from_static(b"c1"));
        assert_eq!(queue.pending(), 2);

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, ("a".to_string(), b"a2".to_vec()));
        assert_eq!(second, ("b".to_string(), b"b1".to_vec()));
        assert!(rx.try_recv().is_err());
    }
}
