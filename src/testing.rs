//! In-memory transport for exercising a publisher without a server.

use crate::{
    error::TransportError,
    http::{HttpRequest, HttpResponse, HttpSender},
};
use reqwest::Method;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

#[derive(Debug, Default)]
struct Recorded {
    requests: Vec<HttpRequest>,
    queued: VecDeque<Result<HttpResponse, String>>,
    stubs: Vec<(String, HttpResponse)>,
}

/// An [`HttpSender`] that records every request and answers from canned responses.
///
/// Queued answers ([`respond`](Self::respond), [`fail`](Self::fail)) are used first, in
/// order. After that a request is answered by the stub registered for its path, or `404`.
/// Clones share their recordings, so a clone can be handed to a registry and inspected later.
///
/// ```
/// use metrics_influx_publisher::{HttpResponse, testing::RecordingSender};
/// let sender = RecordingSender::default()
///     .stub("/ping", HttpResponse::new(204).with_header("X-Influxdb-Version", "1.8.10"))
///     .stub("/write", HttpResponse::new(204));
/// assert!(sender.requests().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSender {
    /// Queues a response for the next unanswered request.
    #[must_use]
    pub fn respond(self, response: HttpResponse) -> Self {
        self.with(|recorded| recorded.queued.push_back(Ok(response)));
        self
    }

    /// Queues a transport failure for the next unanswered request.
    #[must_use]
    pub fn fail(self, message: &str) -> Self {
        self.with(|recorded| recorded.queued.push_back(Err(message.to_string())));
        self
    }

    /// Answers every request for `path` with `response`.
    #[must_use]
    pub fn stub(self, path: &str, response: HttpResponse) -> Self {
        self.with(|recorded| recorded.stubs.push((path.to_string(), response)));
        self
    }

    /// Every request sent so far.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.with(|recorded| recorded.requests.clone())
    }

    /// Requests sent with `method`.
    #[must_use]
    pub fn requests_with(&self, method: &Method) -> Vec<HttpRequest> {
        self.with(|recorded| {
            recorded
                .requests
                .iter()
                .filter(|request| &request.method == method)
                .cloned()
                .collect()
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> T {
        let mut recorded = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut recorded)
    }
}

impl HttpSender for RecordingSender {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.with(|recorded| {
            recorded.requests.push(request.clone());
            if let Some(answer) = recorded.queued.pop_front() {
                return answer.map_err(TransportError::Other);
            }
            Ok(recorded
                .stubs
                .iter()
                .find(|(path, _)| path == request.url.path())
                .map_or_else(|| HttpResponse::new(404), |(_, response)| response.clone()))
        })
    }
}
