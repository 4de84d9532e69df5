//! Test doubles for exercising the engine without a network
//!
//! [`MockTransport`] implements [`HttpTransport`] over canned replies.
//! Replies are served from per-route queues (matched by URL substring)
//! first, then from a global FIFO queue. Every request that reaches the
//! transport is recorded for later assertions.

use parking_lot::Mutex;
use std::collections::VecDeque;

use async_trait::async_trait;

use crate::http::transport::{
    HttpResponse, HttpTransport, PreparedRequest, TransportError, TransportErrorKind,
};

type MockReply = std::result::Result<HttpResponse, TransportError>;

/// An in-memory [`HttpTransport`] serving queued replies
#[derive(Default)]
pub struct MockTransport {
    queue: Mutex<VecDeque<MockReply>>,
    routes: Mutex<Vec<(String, VecDeque<MockReply>)>>,
    recorded: Mutex<Vec<PreparedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fully built response
    pub fn enqueue(&self, response: HttpResponse) {
        self.queue.lock().push_back(Ok(response));
    }

    /// Queue a JSON response with the given status
    pub fn enqueue_json(&self, status: u16, body: serde_json::Value) {
        self.enqueue(response_builder(status, body.to_string()).build());
    }

    /// Queue a network-level failure
    pub fn enqueue_error(&self, kind: TransportErrorKind, message: impl Into<String>) {
        self.queue.lock().push_back(Err(TransportError {
            kind,
            message: message.into(),
        }));
    }

    /// Queue a JSON response served only to URLs containing `fragment`.
    /// Routes take precedence over the global queue and are matched in
    /// registration order.
    pub fn route_json(&self, fragment: impl Into<String>, status: u16, body: serde_json::Value) {
        let fragment = fragment.into();
        let reply = Ok(response_builder(status, body.to_string()).build());
        let mut routes = self.routes.lock();
        if let Some((_, queue)) = routes.iter_mut().find(|(f, _)| *f == fragment) {
            queue.push_back(reply);
        } else {
            routes.push((fragment, VecDeque::from([reply])));
        }
    }

    /// Every request the transport has served, in order
    pub fn recorded_requests(&self) -> Vec<PreparedRequest> {
        self.recorded.lock().clone()
    }

    fn next_reply(&self, url: &str) -> Option<MockReply> {
        {
            let mut routes = self.routes.lock();
            if let Some((_, queue)) = routes
                .iter_mut()
                .find(|(fragment, queue)| url.contains(fragment.as_str()) && !queue.is_empty())
            {
                return queue.pop_front();
            }
        }
        self.queue.lock().pop_front()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        request: &PreparedRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        self.recorded.lock().push(request.clone());
        let url = request.url.to_string();
        match self.next_reply(&url) {
            Some(Ok(mut response)) => {
                response.url = url;
                Ok(response)
            }
            Some(Err(error)) => Err(error),
            None => Err(TransportError {
                kind: TransportErrorKind::Other,
                message: format!("no mock reply queued for {url}"),
            }),
        }
    }
}

/// Builder for canned [`HttpResponse`] values
pub struct ResponseBuilder {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl ResponseBuilder {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into().to_lowercase(), value.into()));
        self
    }

    pub fn build(self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
            url: String::new(),
        }
    }
}

/// Start building a canned response
pub fn response_builder(status: u16, body: impl Into<String>) -> ResponseBuilder {
    ResponseBuilder {
        status,
        headers: Vec::new(),
        body: body.into(),
    }
}
