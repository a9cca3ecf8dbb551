//! Project sessions: the shared variable map, member fan-out, and debounced
//! persistence for one project id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::storage::CloudStore;

/// Outbound side of one member connection. Batches pushed here are encoded
/// and flushed to the socket by that connection's writer task, so a slow
/// peer never blocks the announcer.
#[derive(Clone)]
pub struct MemberHandle {
    pub conn_id: Uuid,
    tx: mpsc::UnboundedSender<Vec<ServerMessage>>,
}

impl MemberHandle {
    pub fn new(conn_id: Uuid, tx: mpsc::UnboundedSender<Vec<ServerMessage>>) -> Self {
        Self { conn_id, tx }
    }

    fn send(&self, batch: Vec<ServerMessage>) -> bool {
        self.tx.send(batch).is_ok()
    }
}

/// Settings every project created by a registry shares.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub lock_vars: bool,
    pub save_debounce: Duration,
    pub save_prefix: String,
}

struct ProjectState {
    variables: HashMap<String, Value>,
    members: HashMap<Uuid, MemberHandle>,
    save_path: String,
    save_pending: bool,
}

impl ProjectState {
    fn peers_of(&self, announcer: Uuid) -> Vec<MemberHandle> {
        self.members
            .values()
            .filter(|member| member.conn_id != announcer)
            .cloned()
            .collect()
    }

    /// True when the caller should arm a new save timer; at most one timer
    /// is in flight per project.
    fn arm_save(&mut self) -> bool {
        if self.save_pending {
            return false;
        }
        self.save_pending = true;
        true
    }
}

/// A named group of connections sharing one variable map and persistence
/// target. All mutation serializes on the internal mutex; storage I/O never
/// runs while it is held.
pub struct Project {
    id: String,
    settings: SessionSettings,
    store: Arc<dyn CloudStore>,
    state: Arc<Mutex<ProjectState>>,
}

impl Project {
    pub fn new(id: String, settings: SessionSettings, store: Arc<dyn CloudStore>) -> Self {
        let save_path = format!("{}{}.json", settings.save_prefix, id);
        Self {
            id,
            settings,
            store,
            state: Arc::new(Mutex::new(ProjectState {
                variables: HashMap::new(),
                members: HashMap::new(),
                save_path,
                save_pending: false,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn join(&self, member: MemberHandle) {
        let mut state = self.state.lock().await;
        state.members.insert(member.conn_id, member);
    }

    /// Idempotent; a connection that never joined is a no-op.
    pub async fn leave(&self, conn_id: Uuid) {
        let mut state = self.state.lock().await;
        state.members.remove(&conn_id);
    }

    /// Write one variable and announce it to every member except the
    /// originator.
    pub async fn set_variable(&self, conn_id: Uuid, name: String, value: Value) {
        let (peers, arm) = {
            let mut state = self.state.lock().await;
            state.variables.insert(name.clone(), value.clone());
            (state.peers_of(conn_id), state.arm_save())
        };
        deliver(&self.id, &peers, vec![ServerMessage::Set { name, value }]);
        if arm {
            self.spawn_save();
        }
    }

    /// Move a value to a new name and announce the new name to the other
    /// members. Ignored when variables are locked or the old name is
    /// absent.
    pub async fn rename_variable(&self, conn_id: Uuid, name: &str, new_name: String) {
        if self.settings.lock_vars {
            debug!(project = %self.id, "rename ignored: variables are locked");
            return;
        }
        let moved = {
            let mut state = self.state.lock().await;
            match state.variables.remove(name) {
                Some(value) => {
                    state.variables.insert(new_name.clone(), value.clone());
                    Some((state.peers_of(conn_id), state.arm_save(), value))
                }
                None => None,
            }
        };
        if let Some((peers, arm, value)) = moved {
            deliver(
                &self.id,
                &peers,
                vec![ServerMessage::Set {
                    name: new_name,
                    value,
                }],
            );
            if arm {
                self.spawn_save();
            }
        }
    }

    /// Remove a variable. Ignored when variables are locked. Deletions are
    /// not announced to other members.
    pub async fn delete_variable(&self, name: &str) {
        if self.settings.lock_vars {
            debug!(project = %self.id, "delete ignored: variables are locked");
            return;
        }
        let arm = {
            let mut state = self.state.lock().await;
            if state.variables.remove(name).is_none() {
                return;
            }
            state.arm_save()
        };
        if arm {
            self.spawn_save();
        }
    }

    /// Redirect the project's persistence key to `username`'s entry, reload
    /// the variable map from it, and replay the loaded state to the
    /// switching connection only. The store read happens before the project
    /// lock is taken; a missing key or undecodable payload means no prior
    /// data.
    pub async fn switch_user(&self, conn_id: Uuid, username: &Value) {
        let username = match username {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let path = format!("{}{}.json", self.settings.save_prefix, username);
        let variables: HashMap<String, Value> = match self.store.read(&path).await {
            Ok(Some(payload)) => serde_json::from_slice(&payload).unwrap_or_else(|err| {
                warn!(project = %self.id, path = %path, "stored variables are not a JSON object: {err}");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(err) => {
                warn!(project = %self.id, path = %path, "failed to read stored variables: {err:#}");
                HashMap::new()
            }
        };

        let mut state = self.state.lock().await;
        debug!(project = %self.id, path = %path, "save path switched by user variable");
        state.save_path = path;
        state.variables = variables;
        let batch: Vec<ServerMessage> = state
            .variables
            .iter()
            .map(|(name, value)| ServerMessage::Set {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        if batch.is_empty() {
            return;
        }
        if let Some(member) = state.members.get(&conn_id) {
            if !member.send(batch) {
                debug!(project = %self.id, conn = %conn_id, "member channel closed during user switch");
            }
        }
    }

    /// Arm the coalescing save timer. On expiry the variable map is
    /// snapshotted under the lock and written outside it, so a burst of
    /// mutations within the window costs exactly one write reflecting the
    /// state at expiry. The timer outlives membership; a save armed before
    /// the last member left still completes.
    fn spawn_save(&self) {
        let project_id = self.id.clone();
        let store = self.store.clone();
        let state = Arc::clone(&self.state);
        let debounce = self.settings.save_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let (path, payload) = {
                let mut state = state.lock().await;
                state.save_pending = false;
                (state.save_path.clone(), serde_json::to_vec(&state.variables))
            };
            match payload {
                Ok(payload) => {
                    if let Err(err) = store.write(&path, payload).await {
                        warn!(project = %project_id, path = %path, "cloud variable save failed: {err:#}");
                    }
                }
                Err(err) => {
                    warn!(project = %project_id, "could not serialize variables: {err}")
                }
            }
        });
    }
}

/// Push one batch to each peer; a closed channel is isolated and logged,
/// never propagated to the announcer or the other members.
fn deliver(project_id: &str, peers: &[MemberHandle], batch: Vec<ServerMessage>) {
    for peer in peers {
        if !peer.send(batch.clone()) {
            debug!(project = %project_id, conn = %peer.conn_id, "dropping broadcast to closed member channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn settings(lock_vars: bool, debounce_ms: u64) -> SessionSettings {
        SessionSettings {
            lock_vars,
            save_debounce: Duration::from_millis(debounce_ms),
            save_prefix: "cloud-vars/".to_string(),
        }
    }

    fn project(store: Arc<MemoryStore>, lock_vars: bool) -> Arc<Project> {
        Arc::new(Project::new(
            "demo".to_string(),
            settings(lock_vars, 50),
            store,
        ))
    }

    async fn join_member(
        project: &Arc<Project>,
    ) -> (Uuid, mpsc::UnboundedReceiver<Vec<ServerMessage>>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        project.join(MemberHandle::new(conn_id, tx)).await;
        (conn_id, rx)
    }

    async fn saved_map(store: &MemoryStore, key: &str) -> HashMap<String, Value> {
        let payload = store.read(key).await.unwrap().expect("nothing saved");
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn set_broadcasts_to_peers_but_never_echoes() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store, false);
        let (a, mut rx_a) = join_member(&project).await;
        let (_b, mut rx_b) = join_member(&project).await;

        project.set_variable(a, "score".into(), json!(10)).await;

        let batch = rx_b.recv().await.expect("peer should be notified");
        assert_eq!(batch.len(), 1);
        let ServerMessage::Set { name, value } = &batch[0];
        assert_eq!(name, "score");
        assert_eq!(value, &json!(10));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn burst_of_sets_coalesces_into_one_save() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;

        for i in 0..5 {
            project.set_variable(a, "n".into(), json!(i)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.write_count(), 1);
        let saved = saved_map(&store, "cloud-vars/demo.json").await;
        assert_eq!(saved.get("n"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn a_new_save_can_be_armed_after_the_window_flushes() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;

        project.set_variable(a, "x".into(), json!(1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        project.set_variable(a, "x".into(), json!(2)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(store.write_count(), 2);
        let saved = saved_map(&store, "cloud-vars/demo.json").await;
        assert_eq!(saved.get("x"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn rename_moves_the_value_and_notifies_peers() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;
        let (_b, mut rx_b) = join_member(&project).await;

        project.set_variable(a, "old".into(), json!(7)).await;
        rx_b.recv().await.expect("set notification");

        project.rename_variable(a, "old", "new".into()).await;
        let batch = rx_b.recv().await.expect("rename notification");
        let ServerMessage::Set { name, value } = &batch[0];
        assert_eq!(name, "new");
        assert_eq!(value, &json!(7));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let saved = saved_map(&store, "cloud-vars/demo.json").await;
        assert!(saved.contains_key("new"));
        assert!(!saved.contains_key("old"));
    }

    #[tokio::test]
    async fn renaming_an_absent_variable_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;
        let (_b, mut rx_b) = join_member(&project).await;

        project.rename_variable(a, "ghost", "new".into()).await;

        assert!(rx_b.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn delete_removes_the_variable_without_broadcasting() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;
        let (_b, mut rx_b) = join_member(&project).await;

        project.set_variable(a, "gone".into(), json!(1)).await;
        rx_b.recv().await.expect("set notification");
        tokio::time::sleep(Duration::from_millis(150)).await;

        project.delete_variable("gone").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(rx_b.try_recv().is_err());
        assert_eq!(store.write_count(), 2);
        let saved = saved_map(&store, "cloud-vars/demo.json").await;
        assert!(saved.is_empty());
    }

    #[tokio::test]
    async fn rename_and_delete_are_inert_when_variables_are_locked() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), true);
        let (a, _rx_a) = join_member(&project).await;
        let (_b, mut rx_b) = join_member(&project).await;

        project.set_variable(a, "v".into(), json!(1)).await;
        rx_b.recv().await.expect("set notification");
        tokio::time::sleep(Duration::from_millis(150)).await;

        project.rename_variable(a, "v", "w".into()).await;
        project.delete_variable("v").await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(rx_b.try_recv().is_err());
        assert_eq!(store.write_count(), 1);
        let saved = saved_map(&store, "cloud-vars/demo.json").await;
        assert_eq!(saved.get("v"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn username_switch_replays_stored_variables_to_the_switcher_only() {
        let store = Arc::new(MemoryStore::new());
        store
            .write(
                "cloud-vars/alice.json",
                serde_json::to_vec(&json!({"a": 1, "b": "x"})).unwrap(),
            )
            .await
            .unwrap();
        let project = project(store.clone(), false);
        let (_a, mut rx_a) = join_member(&project).await;
        let (b, mut rx_b) = join_member(&project).await;

        project.switch_user(b, &json!("alice")).await;

        let batch = rx_b.recv().await.expect("switcher should get a replay");
        assert_eq!(batch.len(), 2);
        let replay: HashMap<String, Value> = batch
            .into_iter()
            .map(|message| {
                let ServerMessage::Set { name, value } = message;
                (name, value)
            })
            .collect();
        assert_eq!(replay.get("a"), Some(&json!(1)));
        assert_eq!(replay.get("b"), Some(&json!("x")));
        assert!(rx_a.try_recv().is_err());

        // The project now persists under alice's key.
        project.set_variable(b, "c".into(), json!(2)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let saved = saved_map(&store, "cloud-vars/alice.json").await;
        assert_eq!(saved.len(), 3);
        assert_eq!(saved.get("c"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn username_switch_with_no_stored_data_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;

        project.set_variable(a, "stale".into(), json!(1)).await;
        project.switch_user(a, &json!("ghost")).await;

        project.set_variable(a, "fresh".into(), json!(2)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let saved = saved_map(&store, "cloud-vars/ghost.json").await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.get("fresh"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn non_string_usernames_use_their_json_rendering() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store.clone(), false);
        let (a, _rx_a) = join_member(&project).await;

        project.switch_user(a, &json!(42)).await;
        project.set_variable(a, "x".into(), json!(1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(store.read("cloud-vars/42.json").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn departed_members_receive_no_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store, false);
        let (a, _rx_a) = join_member(&project).await;
        let (b, mut rx_b) = join_member(&project).await;

        project.leave(b).await;
        project.set_variable(a, "after".into(), json!(1)).await;

        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_closed_member_channel_does_not_poison_the_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let project = project(store, false);
        let (a, _rx_a) = join_member(&project).await;
        let (_b, rx_b) = join_member(&project).await;
        let (_c, mut rx_c) = join_member(&project).await;

        drop(rx_b);
        project.set_variable(a, "x".into(), json!(1)).await;

        let batch = rx_c.recv().await.expect("healthy peer still notified");
        assert_eq!(batch.len(), 1);
    }
}
