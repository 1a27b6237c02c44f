use crate::ConnectionStore;
use crate::connection::SharedConnection;
use itertools::Itertools;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Read-only, hierarchical access to the connection tree.
///
/// Supported keys:
/// - `network:system/state`
/// - `network:tree[/<pid>[/<scope>[/<conn id>]]]`
///
/// Connections that are not yet data-complete are invisible.
pub fn query(store: &ConnectionStore, key: &str) -> Option<Value> {
    let path = key.strip_prefix("network:")?;

    if path == "system/state" {
        return Some(system_state(store));
    }

    let mut segments = path.splitn(4, '/');

    if segments.next()? != "tree" {
        return None;
    }

    let connections = visible_connections(store);

    match (segments.next(), segments.next(), segments.next()) {
        (None, ..) => Some(render_tree(&connections)),
        (Some(pid), None, _) => {
            let pid: i32 = pid.parse().ok()?;
            let of_pid = connections
                .iter()
                .filter(|c| c.lock().pid == pid)
                .cloned()
                .collect_vec();

            if of_pid.is_empty() {
                return None;
            }

            Some(render_scopes(&of_pid))
        }
        (Some(pid), Some(scope), conn_id) => {
            let pid: i32 = pid.parse().ok()?;

            let in_scope = connections
                .iter()
                .filter(|c| {
                    let conn = c.lock();
                    conn.pid == pid && conn.scope.to_string() == scope
                })
                .cloned()
                .collect_vec();

            match conn_id {
                None => {
                    if in_scope.is_empty() {
                        return None;
                    }

                    Some(Value::Array(
                        in_scope.iter().map(|c| c.lock().render()).collect(),
                    ))
                }
                Some(conn_id) => in_scope
                    .iter()
                    .find(|c| c.lock().id == conn_id)
                    .map(|c| c.lock().render()),
            }
        }
    }
}

fn visible_connections(store: &ConnectionStore) -> Vec<SharedConnection> {
    store
        .list()
        .into_iter()
        .chain(store.list_dns())
        .filter(|c| c.lock().data_complete)
        .collect()
}

fn system_state(store: &ConnectionStore) -> Value {
    let connections = visible_connections(store);

    let active = connections.iter().filter(|c| !c.lock().has_ended()).count();
    let blocked = connections
        .iter()
        .filter(|c| !c.lock().verdict_active().is_allowing())
        .count();

    json!({
        "tracked_connections": connections.len(),
        "active_connections": active,
        "blocked_connections": blocked,
    })
}

fn render_tree(connections: &[SharedConnection]) -> Value {
    let mut by_pid: BTreeMap<i32, Vec<&SharedConnection>> = BTreeMap::new();

    for conn in connections {
        by_pid.entry(conn.lock().pid).or_default().push(conn);
    }

    Value::Object(
        by_pid
            .into_iter()
            .map(|(pid, conns)| {
                let conns = conns.into_iter().cloned().collect_vec();
                (pid.to_string(), render_scopes(&conns))
            })
            .collect(),
    )
}

fn render_scopes(connections: &[SharedConnection]) -> Value {
    let mut by_scope: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for conn in connections {
        let conn = conn.lock();
        by_scope.entry(conn.scope.to_string()).or_default().push(conn.render());
    }

    Value::Object(
        by_scope
            .into_iter()
            .map(|(scope, conns)| (scope, Value::Array(conns)))
            .collect(),
    )
}
