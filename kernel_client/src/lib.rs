// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_derive::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const KERNEL_API_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(2);
const START_MAX_RETRIES: usize = 10;
const START_RETRY_DELAY: Duration = Duration::from_secs(1);

// One-shot initialization cell: configure a CJK-capable font so rendered
// figures don't fall back to tofu glyphs.
const INIT_CELL: &str = "import matplotlib\n\
    matplotlib.rcParams['font.family'] = ['SimHei']\n\
    matplotlib.rcParams['axes.unicode_minus'] = False\n";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Timeout,
    KernelDead,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Text,
    ImagePngBase64,
    ConnectionError,
    ExecutionError,
    TimeoutError,
    ProcessingError,
}

/// The outcome of one code submission.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub kind: ResultKind,
    pub value: Option<String>,
}

impl ExecutionResult {
    fn connection_lost() -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::Error,
            kind: ResultKind::ConnectionError,
            value: Some("Execution engine connection lost.".to_owned()),
        }
    }
}

/// Kernel lifecycle, tracked for health reporting and logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelState {
    None,
    Starting,
    Ready,
    Busy,
    Dead,
}

#[derive(Debug)]
pub struct KernelError(pub String);

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for KernelError {}

// The kernel channel message envelope. Everything defaults so that partial
// frames (and there are many: kernels omit fields freely) still parse.

#[derive(Debug, Default, Deserialize)]
pub struct MessageHeader {
    #[serde(default)]
    pub msg_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub execution_state: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KernelMessage {
    #[serde(default)]
    pub header: MessageHeader,
    #[serde(default)]
    pub parent_header: MessageHeader,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// What the receive loop should do after a message has been folded in.
#[derive(Debug, Eq, PartialEq)]
enum Observed {
    Continue,
    Done,
    Dead,
}

///
/// Folds the stream of kernel messages for one execution into a result.
///
/// Selection policy on completion, in priority order: a recorded error beats
/// everything, a rendered image beats text, otherwise the concatenated text
/// output wins.
///
#[derive(Default)]
struct OutputAggregator {
    text_parts: Vec<String>,
    image_base64: Option<String>,
    error: Option<String>,
}

impl OutputAggregator {
    fn observe(&mut self, message: &KernelMessage, current_msg_id: &str) -> Observed {
        // A dead execution state ends the session no matter which request the
        // message belongs to.
        if message.content.execution_state.as_deref() == Some("dead") {
            return Observed::Dead;
        }

        if message.parent_header.msg_id != current_msg_id {
            return Observed::Continue;
        }

        match message.msg_type.as_str() {
            "stream" => {
                if let Some(text) = &message.content.text {
                    self.text_parts.push(text.clone());
                }
                Observed::Continue
            }
            "execute_result" => {
                if let Some(text) = message
                    .content
                    .data
                    .as_ref()
                    .and_then(|data| data.get("text/plain"))
                    .and_then(|value| value.as_str())
                {
                    self.text_parts.push(text.to_owned());
                }
                Observed::Continue
            }
            "display_data" => {
                // A later figure overwrites an earlier one.
                if let Some(image) = message
                    .content
                    .data
                    .as_ref()
                    .and_then(|data| data.get("image/png"))
                    .and_then(|value| value.as_str())
                {
                    self.image_base64 = Some(image.to_owned());
                }
                Observed::Continue
            }
            "error" => {
                self.error = Some(format!(
                    "{}: {}",
                    message.content.ename.as_deref().unwrap_or("Error"),
                    message.content.evalue.as_deref().unwrap_or_default()
                ));
                Observed::Done
            }
            "status" => {
                if message.content.execution_state.as_deref() == Some("idle") {
                    Observed::Done
                } else {
                    Observed::Continue
                }
            }
            _ => Observed::Continue,
        }
    }

    fn finish(self) -> ExecutionResult {
        if let Some(error) = self.error {
            return ExecutionResult {
                status: ExecutionStatus::Error,
                kind: ResultKind::ExecutionError,
                value: Some(error),
            };
        }
        if let Some(image) = self.image_base64 {
            return ExecutionResult {
                status: ExecutionStatus::Ok,
                kind: ResultKind::ImagePngBase64,
                value: Some(image),
            };
        }
        ExecutionResult {
            status: ExecutionStatus::Ok,
            kind: ResultKind::Text,
            value: Some(self.text_parts.concat()),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Inner {
    kernel_id: Option<String>,
    channel: Option<WsStream>,
    state: KernelState,
}

///
/// One persistent Jupyter-compatible kernel behind its manager's REST API and
/// websocket channel.
///
/// Exactly one execution runs at a time: every operation that touches the
/// channel serializes on the session mutex, including `reset`.
///
pub struct KernelSession {
    api_url: String,
    ws_url: String,
    client: reqwest::Client,
    execution_timeout: Duration,
    inner: Mutex<Inner>,
}

impl KernelSession {
    pub fn new(kernel_host: &str, execution_timeout: Duration) -> KernelSession {
        KernelSession {
            api_url: format!("http://{kernel_host}"),
            ws_url: format!("ws://{kernel_host}"),
            client: reqwest::Client::new(),
            execution_timeout,
            inner: Mutex::new(Inner {
                kernel_id: None,
                channel: None,
                state: KernelState::None,
            }),
        }
    }

    pub async fn state(&self) -> KernelState {
        self.inner.lock().await.state
    }

    ///
    /// Allocate a kernel, open its channel, and run the initialization cell.
    /// Retried with a fixed delay while the kernel manager is still coming up
    /// inside a freshly booted container.
    ///
    pub async fn start(&self) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner).await
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<(), KernelError> {
        if inner.kernel_id.is_some() {
            log::warn!("Kernel is already running.");
            return Ok(());
        }
        inner.state = KernelState::Starting;

        let mut last_error = String::new();
        for attempt in 1..=START_MAX_RETRIES {
            match self.start_once(inner).await {
                Ok(()) => {
                    inner.state = KernelState::Ready;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Unable to start kernel (attempt {attempt}/{START_MAX_RETRIES}): {e}"
                    );
                    last_error = e;
                    self.teardown(inner).await;
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
            }
        }
        inner.state = KernelState::Dead;
        Err(KernelError(format!(
            "Failed to start kernel after {START_MAX_RETRIES} attempts: {last_error}"
        )))
    }

    async fn start_once(&self, inner: &mut Inner) -> Result<(), String> {
        #[derive(Deserialize)]
        struct KernelCreated {
            id: String,
        }

        let created: KernelCreated = self
            .client
            .post(format!("{}/api/kernels", self.api_url))
            .json(&serde_json::json!({"name": "python"}))
            .timeout(KERNEL_API_TIMEOUT)
            .send()
            .await
            .map_err(|e| format!("Kernel manager unreachable: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Kernel allocation failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Malformed kernel allocation response: {e}"))?;
        log::info!("Kernel created, id: {}", created.id);

        let (channel, _) = connect_async(format!(
            "{}/api/kernels/{}/channels",
            self.ws_url, created.id
        ))
        .await
        .map_err(|e| format!("Failed to open kernel channel: {e}"))?;

        inner.kernel_id = Some(created.id);
        inner.channel = Some(channel);

        log::info!("Initializing kernel environment...");
        let init_result = self.execute_locked(inner, INIT_CELL).await;
        if init_result.status != ExecutionStatus::Ok {
            return Err(format!(
                "Kernel environment initialization failed: {:?}",
                init_result.value
            ));
        }
        log::info!("Kernel environment initialized.");
        Ok(())
    }

    /// Close the channel and delete the kernel, tolerating a manager that has
    /// already forgotten it.
    async fn teardown(&self, inner: &mut Inner) {
        if let Some(mut channel) = inner.channel.take() {
            let _ = channel.close(None).await;
        }
        if let Some(kernel_id) = inner.kernel_id.take() {
            log::warn!("Shutting down kernel {kernel_id}...");
            if let Err(e) = self
                .client
                .delete(format!("{}/api/kernels/{kernel_id}", self.api_url))
                .timeout(KERNEL_API_TIMEOUT)
                .send()
                .await
            {
                log::warn!("Error shutting down kernel {kernel_id}: {e}");
            }
        }
    }

    /// Protocol ping with a short deadline.
    pub async fn is_healthy(&self) -> bool {
        let mut inner = self.inner.lock().await;
        Self::ping(&mut inner).await
    }

    async fn ping(inner: &mut Inner) -> bool {
        let Some(channel) = inner.channel.as_mut() else {
            return false;
        };
        if channel.send(Message::Ping(Vec::new())).await.is_err() {
            return false;
        }
        let wait_for_pong = async {
            while let Some(frame) = channel.next().await {
                match frame {
                    Ok(Message::Pong(_)) => return true,
                    Ok(_) => (),
                    Err(_) => return false,
                }
            }
            false
        };
        tokio::time::timeout(HEALTH_PING_TIMEOUT, wait_for_pong)
            .await
            .unwrap_or(false)
    }

    ///
    /// Restart the kernel process and connect to the replacement. The session
    /// mutex is held for the whole teardown-and-restart, so an in-flight
    /// execution finishes (or times out) first and no execution can observe
    /// the kernel half-replaced.
    ///
    pub async fn reset(&self) -> Result<(), KernelError> {
        log::warn!("Resetting kernel...");
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        inner.state = KernelState::None;
        self.start_locked(&mut inner).await
    }

    ///
    /// Execute one code submission and aggregate its output. The whole
    /// receive loop is bounded by the configured execution timeout.
    ///
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        let preview: String = code.chars().take(100).collect();
        log::info!("Executing code: {}", preview.replace('\n', " "));
        let started = std::time::Instant::now();

        let mut inner = self.inner.lock().await;
        let result = self.execute_locked(&mut inner, code).await;

        log::info!(
            "Code execution completed. Status: {:?}, duration: {:.2}s",
            result.status,
            started.elapsed().as_secs_f64()
        );
        result
    }

    async fn execute_locked(&self, inner: &mut Inner, code: &str) -> ExecutionResult {
        // A stale channel gets one reconnect attempt before we give up.
        if !Self::ping(inner).await {
            log::warn!("Kernel channel unhealthy, attempting to reconnect...");
            if let Err(e) = self.reconnect(inner).await {
                log::error!("Kernel channel reconnect failed: {e}");
                inner.state = KernelState::Dead;
                return ExecutionResult::connection_lost();
            }
        }

        inner.state = KernelState::Busy;
        let result = self.run_request(inner, code).await;
        inner.state = match result.status {
            ExecutionStatus::KernelDead => KernelState::Dead,
            _ => KernelState::Ready,
        };
        result
    }

    async fn reconnect(&self, inner: &mut Inner) -> Result<(), String> {
        let kernel_id = inner
            .kernel_id
            .as_ref()
            .ok_or("no kernel allocated")?
            .clone();
        let (channel, _) = connect_async(format!(
            "{}/api/kernels/{kernel_id}/channels",
            self.ws_url
        ))
        .await
        .map_err(|e| e.to_string())?;
        inner.channel = Some(channel);
        Ok(())
    }

    async fn run_request(&self, inner: &mut Inner, code: &str) -> ExecutionResult {
        let Some(channel) = inner.channel.as_mut() else {
            return ExecutionResult::connection_lost();
        };

        let msg_id = uuid::Uuid::new_v4().simple().to_string();
        let request = serde_json::json!({
            "header": {
                "msg_id": msg_id,
                "username": "api",
                "session": uuid::Uuid::new_v4().simple().to_string(),
                "msg_type": "execute_request",
                "version": "5.3",
            },
            "parent_header": {},
            "metadata": {},
            "content": {
                "code": code,
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": false,
            },
            "buffers": [],
            "channel": "shell",
        });

        if channel
            .send(Message::Text(request.to_string()))
            .await
            .is_err()
        {
            return ExecutionResult::connection_lost();
        }

        match tokio::time::timeout(self.execution_timeout, Self::receive_loop(channel, &msg_id))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Code execution timed out (exceeded {:?}).",
                    self.execution_timeout
                );
                ExecutionResult {
                    status: ExecutionStatus::Timeout,
                    kind: ResultKind::TimeoutError,
                    value: Some(format!(
                        "Code execution timed out (exceeded {} seconds).",
                        self.execution_timeout.as_secs()
                    )),
                }
            }
        }
    }

    async fn receive_loop(channel: &mut WsStream, msg_id: &str) -> ExecutionResult {
        let mut aggregator = OutputAggregator::default();
        loop {
            let frame = match channel.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    log::error!("Kernel channel error during execution: {e}");
                    return ExecutionResult::connection_lost();
                }
                None => return ExecutionResult::connection_lost(),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => return ExecutionResult::connection_lost(),
                // Control frames carry no kernel payload.
                _ => continue,
            };
            let message: KernelMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    return ExecutionResult {
                        status: ExecutionStatus::Error,
                        kind: ResultKind::ProcessingError,
                        value: Some(format!("Unexpected processing error: {e}")),
                    };
                }
            };
            log::trace!("kernel message: {} ({})", message.msg_type, message.header.msg_id);
            match aggregator.observe(&message, msg_id) {
                Observed::Continue => (),
                Observed::Done => return aggregator.finish(),
                Observed::Dead => {
                    return ExecutionResult {
                        status: ExecutionStatus::KernelDead,
                        kind: ResultKind::ProcessingError,
                        value: Some("kernel dead".to_owned()),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
