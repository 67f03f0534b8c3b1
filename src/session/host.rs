use std::collections::BTreeMap;

use log::{debug, info};

use crate::protocol::ProtocolMessage;

/// The editor-side collaborator a session talks to.
///
/// The protocol treats scene data as opaque bytes. A host decides what a
/// snapshot looks like, how a change is applied and what a console command does.
pub trait SceneHost {
    /// Serialized scene snapshot, if this side has one to hand out.
    fn scene_state(&self) -> Option<Vec<u8>>;

    /// Replaces the local scene with a received snapshot.
    fn apply_scene_state(&mut self, data: &[u8]);

    /// Applies one incremental scene change. Also sees relayed
    /// `SceneStateRequest`s.
    fn apply_change(&mut self, msg: &ProtocolMessage) {
        let _ = msg;
    }

    /// Changes applied on top of [`scene_state`](Self::scene_state), in order.
    /// A joining peer receives them right after the snapshot.
    fn changes_since_snapshot(&self) -> Vec<ProtocolMessage> {
        Vec::new()
    }

    /// Runs a console command. Output is sent back to the caller.
    fn execute_command(&mut self, command: &str) -> Option<String> {
        let _ = command;
        None
    }

    /// Names of the scripts available to clients.
    fn scripts(&self) -> Vec<String> {
        Vec::new()
    }

    fn create_script(&mut self, name: &str, source: &str) -> bool {
        let _ = (name, source);
        false
    }

    /// Script names announced by the server.
    fn script_list(&mut self, names: &[String]) {
        let _ = names;
    }
}

/// In-memory host used by the standalone server and the headless client.
///
/// Keeps the last full snapshot with the changes recorded on top of it, and
/// stores scripts by name.
#[derive(Debug, Default, Clone)]
pub struct MemorySceneHost {
    state: Option<Vec<u8>>,
    changes: Vec<ProtocolMessage>,
    scripts: BTreeMap<String, String>,
    remote_scripts: Vec<String>,
}

impl MemorySceneHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: Vec<u8>) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Changes applied since the last snapshot.
    pub fn changes(&self) -> &[ProtocolMessage] {
        &self.changes
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// The last script list received from a server.
    pub fn remote_scripts(&self) -> &[String] {
        &self.remote_scripts
    }
}

impl SceneHost for MemorySceneHost {
    fn scene_state(&self) -> Option<Vec<u8>> {
        self.state.clone()
    }

    fn apply_scene_state(&mut self, data: &[u8]) {
        debug!("replacing scene with {} byte snapshot", data.len());
        self.state = Some(data.to_vec());
        self.changes.clear();
    }

    fn apply_change(&mut self, msg: &ProtocolMessage) {
        if msg.is_scene_change() {
            self.changes.push(msg.clone());
        }
    }

    fn changes_since_snapshot(&self) -> Vec<ProtocolMessage> {
        self.changes.clone()
    }

    fn execute_command(&mut self, command: &str) -> Option<String> {
        let mut words = command.split_whitespace();
        match words.next()? {
            "status" => Some(format!(
                "scene: {}, changes: {}, scripts: {}",
                self.state
                    .as_ref()
                    .map_or("none".to_string(), |s| format!("{} bytes", s.len())),
                self.changes.len(),
                self.scripts.len()
            )),
            "clear" => {
                self.state = None;
                self.changes.clear();
                Some("scene cleared".to_string())
            }
            "scripts" => Some(self.scripts.keys().cloned().collect::<Vec<_>>().join(", ")),
            other => Some(format!("unknown command '{other}'")),
        }
    }

    fn scripts(&self) -> Vec<String> {
        self.scripts.keys().cloned().collect()
    }

    fn create_script(&mut self, name: &str, source: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        info!("storing script '{name}' ({} bytes)", source.len());
        self.scripts.insert(name.to_string(), source.to_string());
        true
    }

    fn script_list(&mut self, names: &[String]) {
        self.remote_scripts = names.to_vec();
    }
}
