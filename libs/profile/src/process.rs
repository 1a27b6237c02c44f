use crate::LayeredProfile;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use warden_model::{PID_NETWORK_HOST, PID_SYSTEM, PID_UNIDENTIFIED, Pid, ProfileId};

/// A process descriptor as handed out by the process/profile store.
#[derive(Clone)]
pub struct Process {
    pub pid: Pid,
    /// Display name, usually the executable name.
    pub name: String,
    pub exec_path: PathBuf,
    pub profile: Arc<LayeredProfile>,
}

impl Process {
    pub fn profile_id(&self) -> &ProfileId {
        self.profile.id()
    }

    /// The executable file name without its directory.
    pub fn exec_name(&self) -> &str {
        self.exec_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.name)
    }

    /// The last two path elements of the binary, e.g. `bin/curl`.
    pub fn binary_tail(&self) -> Vec<&str> {
        let mut tail: Vec<&str> = self
            .exec_path
            .iter()
            .rev()
            .take(2)
            .filter_map(|part| part.to_str())
            .collect();
        tail.reverse();
        tail
    }

    pub fn is_identified(&self) -> bool {
        self.pid >= 0 && self.pid != PID_SYSTEM
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("profile", self.profile.id())
            .finish()
    }
}

/// The narrow contract to the external process/profile store.
pub trait ProcessStore: Send + Sync + 'static {
    /// Returns the process for a PID, creating/refreshing its descriptor and
    /// profile as needed.
    fn get_or_find_process(&self, pid: Pid) -> anyhow::Result<Arc<Process>>;

    /// The descriptor used when no process could be attributed.
    fn unidentified_process(&self, inbound: bool) -> Arc<Process> {
        let pid = if inbound { PID_NETWORK_HOST } else { PID_UNIDENTIFIED };
        let name = if inbound { "Network Host" } else { "Unidentified" };

        Arc::new(Process {
            pid,
            name: name.to_owned(),
            exec_path: PathBuf::new(),
            profile: LayeredProfile::new(
                ProfileId::special(if inbound { "network-host" } else { "unidentified" }),
                crate::Profile::standard(),
            ),
        })
    }
}
