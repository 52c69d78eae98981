use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use kube::ResourceExt;
use kube::runtime::watcher::{self, Event};
use std::collections::HashSet;
use std::pin::pin;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::k8s::{KubeGateway, NamespacedResource};

/// Receives resource changes from a subscription.
///
/// `error` returns true when the failure has been dealt with; otherwise the
/// subscription ends with that error. Either way the stream is not retried.
pub trait WatchHandler<K>: Send + 'static {
    fn added(&mut self, _resource: K) {}
    fn updated(&mut self, _resource: K) {}
    fn deleted(&mut self, _resource: K) {}
    fn error(&mut self, _error: &anyhow::Error) -> bool {
        false
    }
}

type Callback<K> = Box<dyn FnMut(K) + Send>;
type ErrorCallback = Box<dyn FnMut(&anyhow::Error) + Send>;

pub struct WatchCallbacks<K> {
    added: Option<Callback<K>>,
    updated: Option<Callback<K>>,
    deleted: Option<Callback<K>>,
    error: Option<ErrorCallback>,
}

impl<K> Default for WatchCallbacks<K> {
    fn default() -> Self {
        Self {
            added: None,
            updated: None,
            deleted: None,
            error: None,
        }
    }
}

impl<K> WatchCallbacks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added(mut self, callback: impl FnMut(K) + Send + 'static) -> Self {
        self.added = Some(Box::new(callback));
        self
    }

    pub fn on_updated(mut self, callback: impl FnMut(K) + Send + 'static) -> Self {
        self.updated = Some(Box::new(callback));
        self
    }

    pub fn on_deleted(mut self, callback: impl FnMut(K) + Send + 'static) -> Self {
        self.deleted = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnMut(&anyhow::Error) + Send + 'static) -> Self {
        self.error = Some(Box::new(callback));
        self
    }
}

impl<K: 'static> WatchHandler<K> for WatchCallbacks<K> {
    fn added(&mut self, resource: K) {
        if let Some(callback) = self.added.as_mut() {
            callback(resource);
        }
    }

    fn updated(&mut self, resource: K) {
        if let Some(callback) = self.updated.as_mut() {
            callback(resource);
        }
    }

    fn deleted(&mut self, resource: K) {
        if let Some(callback) = self.deleted.as_mut() {
            callback(resource);
        }
    }

    fn error(&mut self, error: &anyhow::Error) -> bool {
        match self.error.as_mut() {
            Some(callback) => {
                callback(error);
                true
            }
            None => false,
        }
    }
}

/// A running watch. Owns exactly one underlying stream, released when the
/// task ends by cancellation, stream closure or failure.
pub struct Subscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl Subscription {
    /// Spawns the dispatch loop and returns once the initial listing has been
    /// delivered, so no change after this call can be missed.
    pub async fn start<K, S, E, H>(stream: S, cancel: CancellationToken, handler: H) -> Result<Self>
    where
        K: kube::Resource + Send + 'static,
        S: Stream<Item = Result<Event<K>, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        H: WatchHandler<K>,
    {
        let cancel = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(dispatch(stream, cancel.clone(), handler, ready_tx));

        if ready_rx.await.is_err() {
            // ended before the initial listing completed
            task.await.context("watch task panicked")??;
            return Ok(Self { cancel, task: None });
        }

        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub async fn finished(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await.context("watch task panicked")?,
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl KubeGateway {
    pub async fn start_watching<K, H>(
        &self,
        namespace: &str,
        config: watcher::Config,
        cancel: CancellationToken,
        handler: H,
    ) -> Result<Subscription>
    where
        K: NamespacedResource,
        H: WatchHandler<K>,
    {
        debug!(namespace, kind = %K::kind(&()), "starting watch");
        let stream = watcher::watcher(self.api::<K>(namespace), config);
        Subscription::start(stream, cancel, handler).await
    }
}

async fn dispatch<K, S, E, H>(
    stream: S,
    cancel: CancellationToken,
    mut handler: H,
    ready: oneshot::Sender<()>,
) -> Result<()>
where
    K: kube::Resource,
    S: Stream<Item = Result<Event<K>, E>>,
    E: std::error::Error + Send + Sync + 'static,
    H: WatchHandler<K>,
{
    let mut stream = pin!(stream);
    let mut ready = Some(ready);
    let mut seen = HashSet::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("watch cancelled");
                return Ok(());
            }
            next = stream.next() => next,
        };

        match next {
            None => {
                debug!("watch stream closed");
                return Ok(());
            }
            Some(Err(error)) => {
                let error = anyhow::Error::new(error).context("watch stream failed");
                if handler.error(&error) {
                    return Ok(());
                }
                warn!("{error:#}");
                return Err(error);
            }
            Some(Ok(Event::Init)) => {}
            Some(Ok(Event::InitDone)) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
            }
            Some(Ok(Event::InitApply(resource) | Event::Apply(resource))) => {
                if seen.insert(object_key(&resource)) {
                    handler.added(resource);
                } else {
                    handler.updated(resource);
                }
            }
            Some(Ok(Event::Delete(resource))) => {
                seen.remove(&object_key(&resource));
                handler.deleted(resource);
            }
        }
    }
}

fn object_key<K: kube::Resource>(resource: &K) -> String {
    resource.uid().unwrap_or_else(|| {
        format!(
            "{}/{}",
            resource.namespace().unwrap_or_default(),
            resource.name_any()
        )
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Subscription, WatchCallbacks, WatchHandler};
    use futures::channel::mpsc;
    use futures::stream;
    use k8s_openapi::api::core::v1::Pod;
    use kube::runtime::watcher::Event;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    pub(crate) fn pod(name: &str, uid: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some("ns".to_string());
        pod.metadata.uid = Some(uid.to_string());
        pod
    }

    #[derive(Default, Clone)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn recording_callbacks(recorder: &Recorder) -> WatchCallbacks<Pod> {
        let added = recorder.clone();
        let updated = recorder.clone();
        let deleted = recorder.clone();
        WatchCallbacks::new()
            .on_added(move |pod: Pod| added.push(format!("added {}", pod.metadata.name.unwrap())))
            .on_updated(move |pod: Pod| {
                updated.push(format!("updated {}", pod.metadata.name.unwrap()))
            })
            .on_deleted(move |pod: Pod| {
                deleted.push(format!("deleted {}", pod.metadata.name.unwrap()))
            })
    }

    #[tokio::test]
    async fn events_are_routed_to_matching_callbacks() {
        let recorder = Recorder::default();
        let events: Vec<Result<Event<Pod>, io::Error>> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("a", "1"))),
            Ok(Event::InitDone),
            Ok(Event::Apply(pod("a", "1"))),
            Ok(Event::Apply(pod("b", "2"))),
            Ok(Event::Delete(pod("a", "1"))),
            Ok(Event::Apply(pod("a", "3"))),
        ];

        let subscription = Subscription::start(
            stream::iter(events),
            CancellationToken::new(),
            recording_callbacks(&recorder),
        )
        .await
        .unwrap();
        subscription.finished().await.unwrap();

        assert_eq!(
            recorder.entries(),
            vec!["added a", "updated a", "added b", "deleted a", "added a"]
        );
    }

    #[tokio::test]
    async fn unregistered_callbacks_are_skipped() {
        let recorder = Recorder::default();
        let deleted = recorder.clone();
        let callbacks = WatchCallbacks::new().on_deleted(move |pod: Pod| {
            deleted.push(format!("deleted {}", pod.metadata.name.unwrap()))
        });
        let events: Vec<Result<Event<Pod>, io::Error>> = vec![
            Ok(Event::InitApply(pod("a", "1"))),
            Ok(Event::InitDone),
            Ok(Event::Apply(pod("a", "1"))),
            Ok(Event::Delete(pod("a", "1"))),
        ];

        let subscription = Subscription::start(stream::iter(events), CancellationToken::new(), callbacks)
            .await
            .unwrap();
        subscription.finished().await.unwrap();
        assert_eq!(recorder.entries(), vec!["deleted a"]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream_once() {
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::unbounded::<Result<Event<Pod>, io::Error>>();
        tx.unbounded_send(Ok(Event::InitDone)).unwrap();

        let cancel = CancellationToken::new();
        let subscription = Subscription::start(rx, cancel.clone(), recording_callbacks(&recorder))
            .await
            .unwrap();
        assert!(!subscription.is_finished());

        cancel.cancel();
        cancel.cancel();
        subscription.stop();
        subscription.finished().await.unwrap();

        // the receiver was dropped with the task
        assert!(tx.unbounded_send(Ok(Event::Apply(pod("late", "9")))).is_err());
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test]
    async fn stopping_after_natural_end_is_a_no_op() {
        let events: Vec<Result<Event<Pod>, io::Error>> = vec![Ok(Event::InitDone)];
        let subscription = Subscription::start(
            stream::iter(events),
            CancellationToken::new(),
            WatchCallbacks::new(),
        )
        .await
        .unwrap();

        tokio::task::yield_now().await;
        subscription.stop();
        subscription.stop();
        assert!(subscription.finished().await.is_ok());
    }

    #[tokio::test]
    async fn failures_go_to_the_error_callback() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let callbacks = WatchCallbacks::<Pod>::new()
            .on_error(move |error: &anyhow::Error| sink.lock().unwrap().push(format!("{error:#}")));
        let events: Vec<Result<Event<Pod>, io::Error>> = vec![
            Ok(Event::InitDone),
            Err(io::Error::other("connection reset")),
            Ok(Event::Apply(pod("never", "1"))),
        ];

        let subscription = Subscription::start(stream::iter(events), CancellationToken::new(), callbacks)
            .await
            .unwrap();
        subscription.finished().await.unwrap();

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("connection reset"));
    }

    #[tokio::test]
    async fn unhandled_failures_surface_to_the_caller() {
        let events: Vec<Result<Event<Pod>, io::Error>> =
            vec![Err(io::Error::other("list forbidden"))];

        let error = Subscription::start(
            stream::iter(events),
            CancellationToken::new(),
            WatchCallbacks::new(),
        )
        .await
        .err()
        .expect("initial failure should be reported");
        assert!(format!("{error:#}").contains("list forbidden"));
    }

    struct CountingHandler(Arc<Mutex<usize>>);

    impl WatchHandler<Pod> for CountingHandler {
        fn updated(&mut self, _resource: Pod) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn custom_handlers_receive_updates() {
        let count = Arc::new(Mutex::new(0));
        let events: Vec<Result<Event<Pod>, io::Error>> = vec![
            Ok(Event::InitApply(pod("a", "1"))),
            Ok(Event::InitDone),
            Ok(Event::Apply(pod("a", "1"))),
            Ok(Event::Apply(pod("a", "1"))),
        ];

        let subscription = Subscription::start(
            stream::iter(events),
            CancellationToken::new(),
            CountingHandler(count.clone()),
        )
        .await
        .unwrap();
        subscription.finished().await.unwrap();
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
