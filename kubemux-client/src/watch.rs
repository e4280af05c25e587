use futures::{stream, Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{api::ListParams, Api, Client};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::error::{Error, Result};
use crate::pod::{EventKind, PodEvent, PodRef};
use crate::resource::Selector;

/// Watch the pods matching `selector`, as an ordered stream of [`PodEvent`].
///
/// A failure to reach the API server or list the pods is returned here. Once
/// the stream is running, transient watch errors are retried with backoff and
/// only logged.
#[tracing::instrument(skip(client))]
pub async fn watch_pods(
    client: Client,
    namespace: Option<&str>,
    selector: &Selector,
) -> Result<impl Stream<Item = PodEvent> + Send + 'static> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let mut lp = ListParams::default().limit(1);
    let mut config = watcher::Config::default();
    if let Some(labels) = &selector.labels {
        lp = lp.labels(labels);
        config = config.labels(labels);
    }
    if let Some(fields) = &selector.fields {
        lp = lp.fields(fields);
        config = config.fields(fields);
    }

    api.list(&lp).await.map_err(Error::Watch)?;

    let mut tracker = PodTracker::default();
    let events = watcher::watcher(api, config)
        .default_backoff()
        .filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("pod watch error (retrying): {}", e);
                    None
                }
            }
        })
        .map(move |event| stream::iter(tracker.apply(event)))
        .flatten();

    Ok(events)
}

/// Turns watcher events into pod lifecycle events.
///
/// The watcher re-lists after every reconnect. Pods that disappeared while
/// the watch was down never get a delete event, so a relist is diffed
/// against the known set and the missing pods are reported as deleted.
#[derive(Default)]
pub(crate) struct PodTracker {
    known: HashMap<String, PodRef>,
    relisted: Option<HashSet<String>>,
}

impl PodTracker {
    pub(crate) fn apply(&mut self, event: Event<Pod>) -> Vec<PodEvent> {
        match event {
            Event::Apply(pod) => vec![self.upsert(PodRef::from(&pod))],
            Event::Delete(pod) => {
                let pod = PodRef::from(&pod);
                self.known.remove(&pod.uid);
                vec![PodEvent::new(EventKind::Deleted, pod)]
            }
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(pod) => {
                let pod = PodRef::from(&pod);
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(pod.uid.clone());
                }
                vec![self.upsert(pod)]
            }
            Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|uid| !seen.contains(*uid))
                    .cloned()
                    .collect();

                gone.into_iter()
                    .filter_map(|uid| self.known.remove(&uid))
                    .map(|pod| PodEvent::new(EventKind::Deleted, pod))
                    .collect()
            }
        }
    }

    fn upsert(&mut self, pod: PodRef) -> PodEvent {
        let kind = if self.known.contains_key(&pod.uid) {
            EventKind::Modified
        } else {
            EventKind::Added
        };
        self.known.insert(pod.uid.clone(), pod.clone());
        PodEvent::new(kind, pod)
    }
}
