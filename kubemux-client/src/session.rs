//! Per-pod attached work and the bookkeeping that keeps it unique.

use dashmap::{mapref::entry::Entry, DashMap};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::pod::PodRef;

/// Work attached to one pod: a log tail or a tunnel.
pub trait Session: Send + Sync + 'static {
    /// Whether `pod` is eligible at all (e.g. a container matches the filter).
    fn accepts(&self, pod: &PodRef) -> bool;

    /// Follow `pod` until its subject ends or `cancel` fires.
    fn run(&self, cancel: CancellationToken, pod: PodRef) -> impl Future<Output = Result<()>> + Send;

    /// Bounded pass over a pod that is already terminal.
    fn run_once(&self, pod: PodRef) -> impl Future<Output = Result<()>> + Send {
        let _ = pod;
        async { Ok(()) }
    }
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub uid: String,
    pub id: u64,
    pub cancel: CancellationToken,
}

/// Pod UID to its live session.
///
/// Membership only changes through atomic insert-if-absent and
/// remove-if-present calls, so two sessions can never own the same UID.
#[derive(Default)]
pub struct TrackingMap {
    inner: DashMap<String, SessionHandle>,
}

impl TrackingMap {
    /// Registers the handle built by `make` unless `uid` is already tracked.
    /// Returns the registered handle, or `None` when another one owns the UID.
    pub fn start_if_absent(
        &self,
        uid: &str,
        make: impl FnOnce() -> SessionHandle,
    ) -> Option<SessionHandle> {
        match self.inner.entry(uid.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = make();
                slot.insert(handle.clone());
                Some(handle)
            }
        }
    }

    pub fn remove(&self, uid: &str) -> Option<SessionHandle> {
        self.inner.remove(uid).map(|(_, handle)| handle)
    }

    /// Removes `uid` only while it is still owned by session `id`.
    pub fn release(&self, uid: &str, id: u64) -> bool {
        self.inner.remove_if(uid, |_, handle| handle.id == id).is_some()
    }

    pub fn drain(&self) -> Vec<SessionHandle> {
        let uids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        uids.iter().filter_map(|uid| self.remove(uid)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
