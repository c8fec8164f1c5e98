use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;

/// A response written by an action or hook ahead of the normal result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl EarlyResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: body.into(),
        }
    }
}

/// Shared handle to the outgoing response of one request. The first
/// [`ResponseSlot::send`] wins; the transport must not write anything else
/// once a response has been sent.
#[derive(Debug, Clone, Default)]
pub struct ResponseSlot(Arc<Mutex<Option<EarlyResponse>>>);

impl ResponseSlot {
    /// Returns `false` when a response had already been sent.
    pub fn send(&self, response: EarlyResponse) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(response);
        true
    }

    pub fn is_sent(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn sent(&self) -> Option<EarlyResponse> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Transport-side view shared by every module loaded in a chain.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    headers: Arc<BTreeMap<String, String>>,
    is_ssr: bool,
    response: ResponseSlot,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for calls issued while rendering on the server.
    pub fn ssr() -> Self {
        Self {
            is_ssr: true,
            ..Self::default()
        }
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        self.headers = Arc::new(
            headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
        );
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_ssr(&self) -> bool {
        self.is_ssr
    }

    pub fn response(&self) -> &ResponseSlot {
        &self.response
    }
}
