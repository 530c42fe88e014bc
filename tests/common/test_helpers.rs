use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use batchwire::transport::{Transport, TransportError, TransportRequest, TransportResponse};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

pub const ORIGIN: &str = "https://cms.example.com";

/// How the mock answers a batch call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `{"data": [{"data": {"url", "method", "body"}}, ...]}` mirroring the payload.
    Echo,
    Json(Value),
    Status(u16),
    Raw(&'static str),
    Fail(&'static str),
    /// Panic inside `send`.
    Panic(&'static str),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: TransportRequest,
    pub at: Instant,
}

impl RecordedCall {
    pub fn items(&self) -> Vec<Value> {
        match self.request.json_body() {
            Some(Ok(Value::Array(items))) => items,
            other => panic!("batch body is not a JSON array: {other:?}"),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.items()
            .iter()
            .map(|item| item["url"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[derive(Debug)]
struct MockState {
    calls: Mutex<Vec<RecordedCall>>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Reply>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// Scripted batch endpoint. Clones share calls and script.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn replying(fallback: Reply) -> Self {
        Self {
            state: Arc::new(MockState {
                calls: Mutex::new(Vec::new()),
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                gate: Mutex::new(None),
            }),
        }
    }

    pub fn echo() -> Self {
        Self::replying(Reply::Echo)
    }

    pub fn failing(message: &'static str) -> Self {
        Self::replying(Reply::Fail(message))
    }

    /// Queue a one-off reply used before the fallback.
    pub fn then(&self, reply: Reply) -> &Self {
        self.state.script.lock().unwrap().push_back(reply);
        self
    }

    pub fn set_fallback(&self, reply: Reply) {
        *self.state.fallback.lock().unwrap() = reply;
    }

    /// Block every call after it is recorded until [`release`](Self::release).
    pub fn hold(&self) {
        *self.state.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, calls: usize) {
        if let Some(gate) = self.state.gate.lock().unwrap().as_ref() {
            gate.add_permits(calls);
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().unwrap().len()
    }

    fn next_reply(&self) -> Reply {
        let scripted = self.state.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.state.fallback.lock().unwrap().clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let call = RecordedCall { request, at: Instant::now() };
        self.state.calls.lock().unwrap().push(call.clone());

        let gate = self.state.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        match self.next_reply() {
            Reply::Echo => Ok(TransportResponse::json(&echo(&call.items()))),
            Reply::Json(value) => Ok(TransportResponse::json(&value)),
            Reply::Status(status) => Ok(TransportResponse::with_status(status)),
            Reply::Raw(body) => Ok(TransportResponse {
                status: 200,
                body: body.as_bytes().to_vec(),
                ..TransportResponse::default()
            }),
            Reply::Fail(message) => Err(TransportError::Network(message.to_string())),
            Reply::Panic(message) => panic!("{message}"),
        }
    }
}

pub fn echo(items: &[Value]) -> Value {
    let data: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({ "data": { "url": item["url"], "method": item["method"], "body": item["body"] } })
        })
        .collect();
    json!({ "data": data })
}

#[derive(Clone)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogGuard;
    fn make_writer(&'a self) -> Self::Writer {
        LogGuard(self.0.clone())
    }
}

pub struct LogGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture `tracing` output on the current thread until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer(Arc::new(Mutex::new(Vec::new())));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(buffer.clone()))
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
