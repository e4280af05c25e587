//! Turns a pod event stream into exactly one live session per running pod.

use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::client::Kube;
use crate::error::Result;
use crate::pod::{EventKind, PodEvent, PodPhase, PodRef};
use crate::resource::Selector;
use crate::session::{Session, SessionHandle, TrackingMap};
use crate::watch::watch_pods;

/// Watch the pods behind `selector` on `kube` and keep one `session` attached
/// to each running pod until `cancel` fires or the watch ends.
///
/// Only a failure to establish the watch is returned; session failures are
/// logged and reconciliation carries on.
pub async fn attach<S: Session>(
    kube: &Kube,
    selector: &Selector,
    session: Arc<S>,
    cancel: CancellationToken,
) -> Result<()> {
    let events = watch_pods(kube.client.clone(), kube.namespace.as_deref(), selector).await?;

    Reconciler::new(&kube.context, session, &cancel)
        .reconcile(events)
        .await;

    Ok(())
}

pub struct Reconciler<S> {
    target: String,
    session: Arc<S>,
    cancel: CancellationToken,
    tracked: Arc<TrackingMap>,
    tasks: TaskTracker,
    /// UIDs that already had a session, follow or one-shot.
    attached: HashSet<String>,
    next_id: u64,
}

impl<S: Session> Reconciler<S> {
    pub fn new(target: &str, session: Arc<S>, parent: &CancellationToken) -> Self {
        Self {
            target: target.to_string(),
            session,
            cancel: parent.child_token(),
            tracked: Arc::new(TrackingMap::default()),
            tasks: TaskTracker::new(),
            attached: HashSet::new(),
            next_id: 0,
        }
    }

    /// Consume `events` until the stream ends or the reconciler is cancelled,
    /// then stop every session and wait for all of them.
    pub async fn reconcile<St>(mut self, events: St)
    where
        St: Stream<Item = PodEvent>,
    {
        futures::pin_mut!(events);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => self.handle(event),
                    None => {
                        debug!(context = %self.target, "pod watch ended");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    fn handle(&mut self, event: PodEvent) {
        let PodEvent { kind, pod } = event;

        match kind {
            EventKind::Deleted | EventKind::Error => {
                self.attached.remove(&pod.uid);
                self.stop(&pod);
            }
            EventKind::Added | EventKind::Modified if pod.phase.is_terminal() => {
                if !self.stop(&pod) && self.attached.insert(pod.uid.clone()) {
                    self.start_once(pod);
                }
            }
            EventKind::Added | EventKind::Modified if pod.phase == PodPhase::Running => {
                self.start(pod)
            }
            // Pending and Unknown pods have nothing to attach to yet.
            EventKind::Added | EventKind::Modified => {}
        }
    }

    /// Cancels the session tracked for `pod`, if any.
    fn stop(&self, pod: &PodRef) -> bool {
        match self.tracked.remove(&pod.uid) {
            Some(handle) => {
                handle.cancel.cancel();
                info!(context = %self.target, pod = %pod.name, "detaching");
                true
            }
            None => false,
        }
    }

    fn start(&mut self, pod: PodRef) {
        if !self.session.accepts(&pod) {
            return;
        }

        let id = self.next_id;
        let cancel = self.cancel.child_token();
        let Some(handle) = self.tracked.start_if_absent(&pod.uid, || SessionHandle {
            uid: pod.uid.clone(),
            id,
            cancel: cancel.clone(),
        }) else {
            return;
        };
        self.next_id += 1;
        self.attached.insert(pod.uid.clone());

        let release = Release {
            tracked: self.tracked.clone(),
            uid: handle.uid,
            id: handle.id,
        };
        let session = self.session.clone();
        let target = self.target.clone();

        self.tasks.spawn(async move {
            let _release = release;
            info!(context = %target, pod = %pod.name, "attached");
            let name = pod.name.clone();
            if let Err(e) = session.run(handle.cancel, pod).await {
                error!(context = %target, pod = %name, "session failed: {}", e);
            }
            info!(context = %target, pod = %name, "detached");
        });
    }

    fn start_once(&self, pod: PodRef) {
        if !self.session.accepts(&pod) {
            return;
        }

        let session = self.session.clone();
        let target = self.target.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let name = pod.name.clone();
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = session.run_once(pod) => {
                    if let Err(e) = res {
                        error!(context = %target, pod = %name, "one-shot session failed: {}", e);
                    }
                }
            }
        });
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.tracked.drain() {
            handle.cancel.cancel();
        }

        self.tasks.close();
        self.tasks.wait().await;
        debug!(context = %self.target, "all sessions stopped");
    }
}

/// Drops the tracking entry of a finished session, on every exit path.
struct Release {
    tracked: Arc<TrackingMap>,
    uid: String,
    id: u64,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.tracked.release(&self.uid, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use futures::channel::mpsc;

    #[derive(Default)]
    struct Recorder {
        running: AtomicUsize,
        max_running: AtomicUsize,
        follows: AtomicUsize,
        once: AtomicUsize,
        cancelled: AtomicUsize,
        log: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Session for Recorder {
        fn accepts(&self, pod: &PodRef) -> bool {
            !pod.name.starts_with("skip")
        }

        async fn run(&self, cancel: CancellationToken, pod: PodRef) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.follows.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(format!("follow {}", pod.uid));

            if self.fail {
                self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::tunnel(&pod.name, "boom"));
            }

            cancel.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_once(&self, pod: PodRef) -> Result<()> {
            self.once.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(format!("once {}", pod.uid));
            Ok(())
        }
    }

    fn event(kind: EventKind, uid: &str, phase: PodPhase) -> PodEvent {
        PodEvent::new(kind, PodRef::new(uid, &format!("pod-{uid}"), "default", phase))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    struct Harness {
        tx: mpsc::UnboundedSender<PodEvent>,
        done: tokio::task::JoinHandle<()>,
        session: Arc<Recorder>,
        tracked: Arc<TrackingMap>,
        cancel: CancellationToken,
    }

    fn harness(session: Recorder) -> Harness {
        let session = Arc::new(session);
        let cancel = CancellationToken::new();
        let reconciler = Reconciler::new("test", session.clone(), &cancel);
        let tracked = reconciler.tracked.clone();
        let (tx, rx) = mpsc::unbounded();
        let done = tokio::spawn(reconciler.reconcile(rx));
        Harness {
            tx,
            done,
            session,
            tracked,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_pending_running_deleted() {
        let h = harness(Recorder::default());

        h.tx.unbounded_send(event(EventKind::Added, "p", PodPhase::Pending)).unwrap();
        settle().await;
        assert_eq!(h.session.follows.load(Ordering::SeqCst), 0);
        assert!(h.tracked.is_empty());

        h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Running)).unwrap();
        settle().await;
        assert_eq!(h.session.follows.load(Ordering::SeqCst), 1);
        assert_eq!(h.tracked.len(), 1);

        h.tx.unbounded_send(event(EventKind::Deleted, "p", PodPhase::Running)).unwrap();
        settle().await;
        assert!(h.tracked.is_empty());
        assert_eq!(h.session.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.once.load(Ordering::SeqCst), 0);

        drop(h.tx);
        h.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_already_failed_pod_runs_once_untracked() {
        let h = harness(Recorder::default());

        h.tx.unbounded_send(event(EventKind::Added, "q", PodPhase::Failed)).unwrap();
        settle().await;
        assert_eq!(h.session.once.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.follows.load(Ordering::SeqCst), 0);
        assert!(h.tracked.is_empty());

        // Further terminal updates for the same pod do not fetch again.
        h.tx.unbounded_send(event(EventKind::Modified, "q", PodPhase::Failed)).unwrap();
        settle().await;
        assert_eq!(h.session.once.load(Ordering::SeqCst), 1);

        drop(h.tx);
        h.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_tracked_pod_turning_terminal_is_stopped_without_one_shot() {
        let h = harness(Recorder::default());

        h.tx.unbounded_send(event(EventKind::Added, "p", PodPhase::Running)).unwrap();
        h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Succeeded)).unwrap();
        h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Succeeded)).unwrap();
        settle().await;

        assert!(h.tracked.is_empty());
        assert_eq!(h.session.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.once.load(Ordering::SeqCst), 0);

        drop(h.tx);
        h.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_running_events_keep_single_session() {
        let h = harness(Recorder::default());

        for _ in 0..20 {
            h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Running)).unwrap();
        }
        h.tx.unbounded_send(event(EventKind::Added, "r", PodPhase::Running)).unwrap();
        settle().await;

        assert_eq!(h.session.follows.load(Ordering::SeqCst), 2);
        assert_eq!(h.tracked.len(), 2);

        drop(h.tx);
        h.done.await.unwrap();
        assert_eq!(h.session.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_after_delete_leaves_single_live_session() {
        let h = harness(Recorder::default());

        for _ in 0..10 {
            h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Running)).unwrap();
            h.tx.unbounded_send(event(EventKind::Deleted, "p", PodPhase::Running)).unwrap();
        }
        h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Running)).unwrap();
        settle().await;

        assert_eq!(h.tracked.len(), 1);
        assert_eq!(h.session.follows.load(Ordering::SeqCst), 11);
        assert_eq!(h.session.cancelled.load(Ordering::SeqCst), 10);
        assert_eq!(h.session.running.load(Ordering::SeqCst), 1);
        drop(h.tx);
        h.done.await.unwrap();
        assert_eq!(h.session.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ineligible_pod_is_ignored() {
        let h = harness(Recorder::default());

        h.tx.unbounded_send(PodEvent::new(
            EventKind::Added,
            PodRef::new("s", "skip-me", "default", PodPhase::Running),
        ))
        .unwrap();
        h.tx.unbounded_send(PodEvent::new(
            EventKind::Added,
            PodRef::new("t", "skip-too", "default", PodPhase::Failed),
        ))
        .unwrap();
        settle().await;

        assert!(h.tracked.is_empty());
        assert_eq!(h.session.follows.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.once.load(Ordering::SeqCst), 0);

        drop(h.tx);
        h.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_session_is_untracked_and_restartable() {
        let h = harness(Recorder {
            fail: true,
            ..Recorder::default()
        });

        h.tx.unbounded_send(event(EventKind::Added, "p", PodPhase::Running)).unwrap();
        settle().await;
        assert!(h.tracked.is_empty());

        h.tx.unbounded_send(event(EventKind::Modified, "p", PodPhase::Running)).unwrap();
        settle().await;
        assert_eq!(h.session.follows.load(Ordering::SeqCst), 2);

        drop(h.tx);
        h.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_waits_for_every_session() {
        let h = harness(Recorder::default());

        for uid in ["a", "b", "c"] {
            h.tx.unbounded_send(event(EventKind::Added, uid, PodPhase::Running)).unwrap();
        }
        settle().await;
        assert_eq!(h.session.running.load(Ordering::SeqCst), 3);

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.done)
            .await
            .expect("reconciler returns after cancel")
            .unwrap();

        assert_eq!(h.session.running.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.cancelled.load(Ordering::SeqCst), 3);
        assert_eq!(h.session.max_running.load(Ordering::SeqCst), 3);
        assert!(h.tracked.is_empty());
    }

    #[tokio::test]
    async fn test_error_event_detaches() {
        let h = harness(Recorder::default());

        h.tx.unbounded_send(event(EventKind::Added, "p", PodPhase::Running)).unwrap();
        h.tx.unbounded_send(event(EventKind::Error, "p", PodPhase::Running)).unwrap();
        h.tx.unbounded_send(event(EventKind::Error, "x", PodPhase::Running)).unwrap();
        settle().await;

        assert!(h.tracked.is_empty());
        assert_eq!(h.session.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(*h.session.log.lock(), vec!["follow p".to_string()]);

        drop(h.tx);
        h.done.await.unwrap();
    }
}
