#![allow(dead_code)]

use async_trait::async_trait;
use cwcli_resilience::{ApiRequest, RawResponse, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// In-memory transport that replays scripted responses and records every request it sees.
///
/// Once the script runs out it keeps answering with `fallback`.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<RawResponse, TransportError>>>>,
    seen: Arc<Mutex<Vec<ApiRequest>>>,
    fallback: RawResponse,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            seen: Arc::new(Mutex::new(Vec::new())),
            fallback: RawResponse::new(200, r#"{"ok":true}"#),
        }
    }

    pub fn statuses(statuses: &[u16]) -> Self {
        Self::new(statuses.iter().map(|s| Ok(RawResponse::new(*s, body_for(*s)))).collect())
    }

    pub fn with_fallback(mut self, fallback: RawResponse) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn header_values(&self, name: &str) -> Vec<Option<String>> {
        self.requests().iter().map(|r| r.header(name).map(str::to_string)).collect()
    }
}

fn body_for(status: u16) -> String {
    match status {
        200..=299 => format!(r#"{{"ok":true,"status_code":{status}}}"#),
        _ => format!(r#"{{"error":"scripted {status}"}}"#),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
