use crate::cluster::LocalCluster;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::lock::{HolderId, NodeId};
use crate::manager::LocalNotification;
use crate::wire::Message;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub(crate) const WAIT: Duration = Duration::from_secs(5);

static CWD_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub(crate) struct DirGuard {
    original: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl DirGuard {
    pub(crate) fn new(new_dir: &Path) -> Self {
        // The working directory is process-global; hold the lock even if a
        // #[serial] annotation is missed.
        let lock = CWD_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(new_dir).unwrap();
        Self {
            original,
            _lock: lock,
        }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.original);
    }
}

pub(crate) fn holder(node: NodeId, cookie: u64) -> HolderId {
    HolderId::new(node, cookie)
}

/// A cluster of `members` where `resource` is mastered by `master`.
pub(crate) fn pinned_cluster(members: &[NodeId], resource: &str, master: NodeId) -> LocalCluster {
    LocalCluster::start_with(members, |config| {
        config.masters.insert(resource.to_string(), master);
    })
    .unwrap()
}

pub(crate) fn next_notification(rx: &Receiver<LocalNotification>) -> LocalNotification {
    rx.recv_timeout(WAIT).expect("expected a local notification")
}

pub(crate) fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Dispatcher that delivers nothing and hands every message to the test.
pub(crate) struct Sink {
    sent: Sender<(NodeId, NodeId, Message)>,
}

impl Sink {
    pub(crate) fn new() -> (Arc<Self>, Receiver<(NodeId, NodeId, Message)>) {
        let (sent, rx) = unbounded();
        (Arc::new(Self { sent }), rx)
    }
}

impl Dispatcher for Sink {
    fn send(&self, from: NodeId, to: NodeId, message: &Message) -> Result<()> {
        let _ = self.sent.send((from, to, message.clone()));
        Ok(())
    }
}
