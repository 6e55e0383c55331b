//! The streaming sink contract every fetch delivers into.
//!
//! A [`Receiver`] moves through four phases:
//!
//! ```text
//! on_inited ──► on_started ──► on_data* ──► on_finished
//!      │              │                          ▲
//!      │              └──────── on_aborted ──────┤
//!      └─────────────── on_aborted ──────────────┘
//! ```
//!
//! `on_inited` always arrives first; exactly one of `on_finished` /
//! `on_aborted` terminates the stream. An abort carrying `None` is a soft
//! miss or a cancellation, never a failure.

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use http::response;

use crate::{error::CacheError, info::ResourceInfo, progress::Progress};

/// The streaming sink for a fetch.
///
/// Receivers are threaded through store workers as boxed continuations; all
/// callbacks are delivered on the queue of whichever store is serving the
/// request.
#[async_trait]
pub trait Receiver: Send {
    /// Always called first. `response` carries the raw response head when the
    /// bytes come from an HTTP origin, for the benefit of decorators.
    async fn on_inited(&mut self, response: Option<&response::Parts>, progress: &Progress);

    /// The segment to be delivered is known. `offset` is the byte position
    /// within the complete resource; `length` is absent when the origin did
    /// not declare one.
    async fn on_started(&mut self, info: &ResourceInfo, offset: u64, length: Option<u64>);

    /// Zero or more ordered, contiguous, non-overlapping chunks.
    async fn on_data(&mut self, chunk: Bytes);

    /// The segment was delivered completely.
    async fn on_finished(&mut self);

    /// The stream ended early. `None` is a miss or a cancellation.
    async fn on_aborted(&mut self, error: Option<CacheError>);
}

/// Terminal transition observed by a [`ReceiverFilter`] completion hook.
#[derive(Debug)]
pub enum FilterEvent {
    /// The stream completed normally.
    Finished,
    /// The stream ended early, possibly with an error.
    Aborted(Option<CacheError>),
}

impl FilterEvent {
    /// The error carried by an abort, if any.
    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Self::Finished => None,
            Self::Aborted(error) => error.as_ref(),
        }
    }

    /// Whether this is the normal completion transition.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Completion hook for a [`ReceiverFilter`].
///
/// Invoked on the terminal transition with whether `on_started` was seen, the
/// terminal event, ownership of the inner receiver, and the progress handle.
/// Returning `None` consumes the inner receiver and suppresses forwarding;
/// the fallthrough retry path re-drives the same receiver from `on_inited`.
/// Returning the receiver (with an event) forwards that terminal normally.
pub type FilterCompletion = Box<
    dyn FnOnce(
            bool,
            FilterEvent,
            Box<dyn Receiver>,
            Progress,
        ) -> BoxFuture<'static, Option<(Box<dyn Receiver>, FilterEvent)>>
        + Send,
>;

/// A receiver that delegates to an inner receiver, optionally tees every
/// event into a second receiver, and runs a completion hook on terminal
/// transitions.
///
/// The tee is how served bytes are persisted while being delivered; the
/// completion hook is how store→source fallthrough chains retry.
pub struct ReceiverFilter {
    inner: Option<Box<dyn Receiver>>,
    tee: Option<Box<dyn Receiver>>,
    completion: Option<FilterCompletion>,
    progress: Progress,
    started: bool,
    done: bool,
}

impl fmt::Debug for ReceiverFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverFilter")
            .field("has_tee", &self.tee.is_some())
            .field("has_completion", &self.completion.is_some())
            .field("started", &self.started)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ReceiverFilter {
    /// Wraps an inner receiver.
    pub fn new(inner: Box<dyn Receiver>) -> Self {
        Self {
            inner: Some(inner),
            tee: None,
            completion: None,
            progress: Progress::new(),
            started: false,
            done: false,
        }
    }

    /// Tees every event into a second receiver before the inner one sees it.
    #[must_use]
    pub fn tee(mut self, tee: Box<dyn Receiver>) -> Self {
        self.tee = Some(tee);
        self
    }

    /// Installs a completion hook for terminal transitions.
    #[must_use]
    pub fn completion(mut self, completion: FilterCompletion) -> Self {
        self.completion = Some(completion);
        self
    }

    async fn finish(&mut self, event: FilterEvent) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(tee) = self.tee.as_mut() {
            // The tee only needs to observe the transition; the error value
            // stays with the inner receiver.
            match &event {
                FilterEvent::Finished => tee.on_finished().await,
                FilterEvent::Aborted(_) => tee.on_aborted(None).await,
            }
        }
        let Some(inner) = self.inner.take() else {
            return;
        };
        match self.completion.take() {
            Some(hook) => {
                if let Some((mut inner, event)) =
                    hook(self.started, event, inner, self.progress.clone()).await
                {
                    deliver_terminal(&mut inner, event).await;
                    self.inner = Some(inner);
                }
            }
            None => {
                let mut inner = inner;
                deliver_terminal(&mut inner, event).await;
                self.inner = Some(inner);
            }
        }
    }
}

async fn deliver_terminal(receiver: &mut Box<dyn Receiver>, event: FilterEvent) {
    match event {
        FilterEvent::Finished => receiver.on_finished().await,
        FilterEvent::Aborted(error) => receiver.on_aborted(error).await,
    }
}

#[async_trait]
impl Receiver for ReceiverFilter {
    async fn on_inited(&mut self, response: Option<&response::Parts>, progress: &Progress) {
        self.progress = progress.clone();
        if let Some(tee) = self.tee.as_mut() {
            tee.on_inited(response, progress).await;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_inited(response, progress).await;
        }
    }

    async fn on_started(&mut self, info: &ResourceInfo, offset: u64, length: Option<u64>) {
        self.started = true;
        if let Some(tee) = self.tee.as_mut() {
            tee.on_started(info, offset, length).await;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_started(info, offset, length).await;
        }
    }

    async fn on_data(&mut self, chunk: Bytes) {
        if let Some(tee) = self.tee.as_mut() {
            tee.on_data(chunk.clone()).await;
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.on_data(chunk).await;
        }
    }

    async fn on_finished(&mut self) {
        self.finish(FilterEvent::Finished).await;
    }

    async fn on_aborted(&mut self, error: Option<CacheError>) {
        self.finish(FilterEvent::Aborted(error)).await;
    }
}

/// What a [`BufferSink`] accumulated, handed to its completion callback.
#[derive(Debug)]
pub struct BufferOutcome {
    /// Metadata from `on_started`, when the stream got that far.
    pub info: Option<ResourceInfo>,
    /// The accumulated bytes; `None` when the buffer was dropped.
    pub data: Option<Bytes>,
    /// Byte offset of the segment within the complete resource.
    pub offset: u64,
    /// The progress handle observed at `on_inited`.
    pub progress: Option<Progress>,
}

/// Completion callback for a [`BufferSink`]; fires exactly once per stream.
pub type BufferCompletion = Box<dyn FnOnce(BufferOutcome) -> BoxFuture<'static, ()> + Send>;

/// A receiver that accumulates the stream into memory.
///
/// The buffer is dropped (silently, with the completion still firing) when
/// the declared length exceeds `size_limit`, when appending a chunk would,
/// or when `accept_partial` is off and the delivered segment is not the
/// complete resource. An abort always drops whatever was accumulated.
pub struct BufferSink {
    size_limit: usize,
    accept_partial: bool,
    buffer: Option<BytesMut>,
    info: Option<ResourceInfo>,
    offset: u64,
    progress: Option<Progress>,
    completion: Option<BufferCompletion>,
    done: bool,
}

impl fmt::Debug for BufferSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSink")
            .field("size_limit", &self.size_limit)
            .field("accept_partial", &self.accept_partial)
            .field("buffered", &self.buffer.as_ref().map(|b| b.len()))
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl BufferSink {
    /// A sink accumulating up to `size_limit` bytes.
    pub fn new(size_limit: usize, accept_partial: bool, completion: BufferCompletion) -> Self {
        Self {
            size_limit,
            accept_partial,
            buffer: Some(BytesMut::new()),
            info: None,
            offset: 0,
            progress: None,
            completion: Some(completion),
            done: false,
        }
    }

    async fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(completion) = self.completion.take() {
            let outcome = BufferOutcome {
                info: self.info.take(),
                data: self.buffer.take().map(BytesMut::freeze),
                offset: self.offset,
                progress: self.progress.take(),
            };
            completion(outcome).await;
        }
    }
}

#[async_trait]
impl Receiver for BufferSink {
    async fn on_inited(&mut self, _response: Option<&response::Parts>, progress: &Progress) {
        self.progress = Some(progress.clone());
    }

    async fn on_started(&mut self, info: &ResourceInfo, offset: u64, length: Option<u64>) {
        self.info = Some(info.clone());
        self.offset = offset;
        if let Some(length) = length {
            if length as usize > self.size_limit {
                self.buffer = None;
                return;
            }
        }
        if !self.accept_partial && (offset != 0 || length != info.total_length) {
            self.buffer = None;
        }
    }

    async fn on_data(&mut self, chunk: Bytes) {
        if let Some(buffer) = self.buffer.as_mut() {
            if buffer.len() + chunk.len() > self.size_limit {
                self.buffer = None;
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }
    }

    async fn on_finished(&mut self) {
        self.finish().await;
    }

    async fn on_aborted(&mut self, _error: Option<CacheError>) {
        self.buffer = None;
        self.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn collecting_sink(
        size_limit: usize,
        accept_partial: bool,
    ) -> (BufferSink, oneshot::Receiver<BufferOutcome>) {
        let (tx, rx) = oneshot::channel();
        let sink = BufferSink::new(
            size_limit,
            accept_partial,
            Box::new(move |outcome| {
                Box::pin(async move {
                    let _ = tx.send(outcome);
                })
            }),
        );
        (sink, rx)
    }

    #[tokio::test]
    async fn buffer_sink_accumulates_complete_resource() {
        let (mut sink, rx) = collecting_sink(1024, false);
        let progress = Progress::new();
        let mut info = ResourceInfo::new();
        info.total_length = Some(8);

        sink.on_inited(None, &progress).await;
        sink.on_started(&info, 0, Some(8)).await;
        sink.on_data(Bytes::from_static(b"abcd")).await;
        sink.on_data(Bytes::from_static(b"efgh")).await;
        sink.on_finished().await;

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.data.as_deref(), Some(&b"abcdefgh"[..]));
        assert_eq!(outcome.info.unwrap().total_length, Some(8));
        assert_eq!(outcome.offset, 0);
    }

    #[tokio::test]
    async fn buffer_sink_drops_on_declared_oversize() {
        let (mut sink, rx) = collecting_sink(10, true);
        let progress = Progress::new();
        let mut info = ResourceInfo::new();
        info.total_length = Some(100);

        sink.on_inited(None, &progress).await;
        sink.on_started(&info, 0, Some(100)).await;
        sink.on_data(Bytes::from_static(b"12345")).await;
        sink.on_finished().await;

        let outcome = rx.await.unwrap();
        assert!(outcome.data.is_none());
        assert!(outcome.info.is_some());
    }

    #[tokio::test]
    async fn buffer_sink_drops_on_overflow_mid_stream() {
        let (mut sink, rx) = collecting_sink(6, true);
        let progress = Progress::new();
        sink.on_inited(None, &progress).await;
        sink.on_started(&ResourceInfo::new(), 0, None).await;
        sink.on_data(Bytes::from_static(b"1234")).await;
        sink.on_data(Bytes::from_static(b"5678")).await;
        sink.on_finished().await;

        assert!(rx.await.unwrap().data.is_none());
    }

    #[tokio::test]
    async fn buffer_sink_rejects_partial_segment() {
        let (mut sink, rx) = collecting_sink(1024, false);
        let progress = Progress::new();
        let mut info = ResourceInfo::new();
        info.total_length = Some(1000);

        sink.on_inited(None, &progress).await;
        sink.on_started(&info, 100, Some(100)).await;
        sink.on_data(Bytes::from_static(b"xx")).await;
        sink.on_finished().await;

        assert!(rx.await.unwrap().data.is_none());
    }

    #[tokio::test]
    async fn buffer_sink_drops_on_abort() {
        let (mut sink, rx) = collecting_sink(1024, true);
        let progress = Progress::new();
        sink.on_inited(None, &progress).await;
        sink.on_started(&ResourceInfo::new(), 0, None).await;
        sink.on_data(Bytes::from_static(b"partial")).await;
        sink.on_aborted(None).await;

        assert!(rx.await.unwrap().data.is_none());
    }

    struct Counting {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Receiver for Counting {
        async fn on_inited(&mut self, _r: Option<&response::Parts>, _p: &Progress) {
            self.events.lock().unwrap().push("inited");
        }
        async fn on_started(&mut self, _i: &ResourceInfo, _o: u64, _l: Option<u64>) {
            self.events.lock().unwrap().push("started");
        }
        async fn on_data(&mut self, _c: Bytes) {
            self.events.lock().unwrap().push("data");
        }
        async fn on_finished(&mut self) {
            self.events.lock().unwrap().push("finished");
        }
        async fn on_aborted(&mut self, error: Option<CacheError>) {
            self.events.lock().unwrap().push(if error.is_some() {
                "aborted(err)"
            } else {
                "aborted"
            });
        }
    }

    #[tokio::test]
    async fn filter_tees_and_forwards() {
        let inner_events = Arc::new(Mutex::new(Vec::new()));
        let tee_events = Arc::new(Mutex::new(Vec::new()));
        let mut filter = ReceiverFilter::new(Box::new(Counting { events: inner_events.clone() }))
            .tee(Box::new(Counting { events: tee_events.clone() }));

        let progress = Progress::new();
        filter.on_inited(None, &progress).await;
        filter.on_started(&ResourceInfo::new(), 0, Some(2)).await;
        filter.on_data(Bytes::from_static(b"ab")).await;
        filter.on_finished().await;
        // Terminal transitions are one-shot.
        filter.on_finished().await;

        let expected = vec!["inited", "started", "data", "finished"];
        assert_eq!(*inner_events.lock().unwrap(), expected);
        assert_eq!(*tee_events.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn filter_completion_can_suppress_forwarding() {
        let inner_events = Arc::new(Mutex::new(Vec::new()));
        let completion: FilterCompletion = Box::new(|found, event, inner, progress| {
            Box::pin(async move {
                if !found && event.error().is_none() && !progress.is_cancelled() {
                    // Consume the receiver: the caller retries elsewhere.
                    None
                } else {
                    Some((inner, event))
                }
            })
        });
        let mut filter = ReceiverFilter::new(Box::new(Counting { events: inner_events.clone() }))
            .completion(completion);

        let progress = Progress::new();
        filter.on_inited(None, &progress).await;
        filter.on_aborted(None).await;

        // A soft miss before on_started is suppressed: no terminal reaches
        // the inner receiver.
        assert_eq!(*inner_events.lock().unwrap(), vec!["inited"]);
    }

    #[tokio::test]
    async fn filter_completion_forwards_after_start() {
        let inner_events = Arc::new(Mutex::new(Vec::new()));
        let completion: FilterCompletion = Box::new(|found, event, inner, progress| {
            Box::pin(async move {
                if !found && event.error().is_none() && !progress.is_cancelled() {
                    None
                } else {
                    Some((inner, event))
                }
            })
        });
        let mut filter = ReceiverFilter::new(Box::new(Counting { events: inner_events.clone() }))
            .completion(completion);

        let progress = Progress::new();
        filter.on_inited(None, &progress).await;
        filter.on_started(&ResourceInfo::new(), 0, None).await;
        filter.on_aborted(None).await;

        assert_eq!(*inner_events.lock().unwrap(), vec!["inited", "started", "aborted"]);
    }
}
