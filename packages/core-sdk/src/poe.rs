use std::future::Future;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ConfigError, Configurable, QuestionId, SetupQuestion, Settings};
use crate::models::{ChatOptions, Message};
use crate::sink::ChunkSink;
use crate::telemetry;
use crate::vendor::{
    HasSetupQuestions, Operation, SupportsListModels, SupportsSend, SupportsSendStream,
    VendorError,
};

pub const VENDOR_NAME: &str = "Poe";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
const API_KEY_HEADER: &str = "Api-Key";

/**
 * \brief 各操作的超时上限。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub list_models: Duration,
    /** \brief Send 与 SendStream 共用，SendStream 计入整个读流过程 */
    pub send: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            list_models: Duration::from_secs(10),
            send: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendResponse {
    content: String,
}

fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: &m.role,
            content: &m.content,
        })
        .collect()
}

/**
 * \brief 本地 Poe 代理服务的 HTTP 客户端，只负责协议往返。
 */
#[derive(Debug, Clone)]
pub struct PoeClient {
    base_url: String,
    http: reqwest::Client,
    timeouts: Timeouts,
}

impl Default for PoeClient {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl PoeClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = base_url.trim_end_matches('/').to_string();
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    fn endpoint(&self, op: Operation) -> String {
        format!("{}{}", self.base_url, op.path())
    }

    /**
     * \brief GET /ListModels，返回代理给出的模型名（保持原顺序）。
     */
    pub async fn list_models(&self) -> Result<Vec<String>, VendorError> {
        let op = Operation::ListModels;
        with_deadline(op, self.timeouts.list_models, async {
            let req = self
                .http
                .get(self.endpoint(op))
                .build()
                .map_err(|source| VendorError::Request { op, source })?;
            let resp = self.execute(op, req).await?;
            let body = resp
                .bytes()
                .await
                .map_err(|source| VendorError::Body { op, source })?;
            let models: Vec<String> = serde_json::from_slice(&body)
                .map_err(|source| VendorError::Decode { op, source })?;
            debug!(count = models.len(), "poe models listed");
            Ok::<_, VendorError>(models)
        })
        .await
    }

    /**
     * \brief POST /Send，返回完整回复内容。
     * \param api_key 为空时不发送 Api-Key 头
     */
    pub async fn send_messages(
        &self,
        api_key: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<String, VendorError> {
        let op = Operation::Send;
        with_deadline(op, self.timeouts.send, async {
            let req = self.post_request(op, api_key, model, messages)?;
            let resp = self.execute(op, req).await?;
            let body = resp
                .bytes()
                .await
                .map_err(|source| VendorError::Body { op, source })?;
            let parsed: SendResponse = serde_json::from_slice(&body)
                .map_err(|source| VendorError::Decode { op, source })?;
            debug!(model, len = parsed.content.len(), "poe send completed");
            Ok::<_, VendorError>(parsed.content)
        })
        .await
    }

    /**
     * \brief POST /SendStream，按行原样转发到 sink。
     * \details 任何结局都会关闭 sink：正常读完为 `close(None)`，否则带上错误描述。
     * 关闭同样受本次调用的截止时间约束，消费端停滞时不会拖住调用方。
     */
    pub async fn send_stream(
        &self,
        api_key: &str,
        model: &str,
        messages: &[Message],
        sink: &mut dyn ChunkSink,
    ) -> Result<(), VendorError> {
        let op = Operation::SendStream;
        let timeout = self.timeouts.send;
        let deadline = Instant::now() + timeout;
        let outcome = match tokio::time::timeout_at(
            deadline,
            self.forward_lines(api_key, model, messages, &mut *sink),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(VendorError::Timeout { op, timeout }),
        };
        let failure = outcome.as_ref().err().map(|e| e.to_string());
        if tokio::time::timeout_at(deadline, sink.close(failure))
            .await
            .is_err()
        {
            warn!(%op, "stream consumer stalled, close abandoned at deadline");
        }
        outcome
    }

    async fn forward_lines(
        &self,
        api_key: &str,
        model: &str,
        messages: &[Message],
        sink: &mut dyn ChunkSink,
    ) -> Result<(), VendorError> {
        let op = Operation::SendStream;
        let req = self.post_request(op, api_key, model, messages)?;
        let resp = self.execute(op, req).await?;

        let mut lines = Box::pin(body_lines(resp));
        let mut forwarded = 0usize;
        while let Some(line) = lines.next().await {
            let line = line.map_err(|source| VendorError::StreamRead { op, source })?;
            sink.push(line)
                .await
                .map_err(|_| VendorError::SinkClosed { op })?;
            forwarded += 1;
        }
        debug!(model, lines = forwarded, "poe stream drained");
        Ok(())
    }

    fn post_request(
        &self,
        op: Operation,
        api_key: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<Request, VendorError> {
        let payload = SendRequest {
            model,
            messages: to_wire_messages(messages),
        };
        let body =
            serde_json::to_vec(&payload).map_err(|source| VendorError::Encode { op, source })?;

        let mut builder = self
            .http
            .post(self.endpoint(op))
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if !api_key.is_empty() {
            builder = builder.header(API_KEY_HEADER, api_key);
        }
        builder
            .build()
            .map_err(|source| VendorError::Request { op, source })
    }

    async fn execute(&self, op: Operation, req: Request) -> Result<Response, VendorError> {
        debug!(%op, url = %req.url(), "poe request");
        let resp = self
            .http
            .execute(req)
            .await
            .map_err(|source| VendorError::Transport { op, source })?;
        let status = resp.status();
        if !status.is_success() {
            warn!(%op, %status, "poe proxy returned non-OK status");
            return Err(VendorError::Status { op, status });
        }
        Ok(resp)
    }
}

async fn with_deadline<T, F>(op: Operation, timeout: Duration, fut: F) -> Result<T, VendorError>
where
    F: Future<Output = Result<T, VendorError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(VendorError::Timeout { op, timeout }),
    }
}

/**
 * \brief 将响应体切分为行；去掉行尾 `\n` 与可选的 `\r`，末尾无换行的非空残片也算一行。
 */
fn body_lines(resp: Response) -> impl Stream<Item = Result<String, reqwest::Error>> {
    let mut body = Box::pin(resp.bytes_stream());
    try_stream! {
        let mut lines = LineBuffer::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            lines.feed(&chunk);
            while let Some(line) = lines.next_line() {
                yield line;
            }
        }
        if let Some(rest) = lines.finish() {
            yield rest;
        }
    }
}

/**
 * \brief 行缓冲：`scanned` 之前的字节已确认不含换行，新数据到达时只扫描新增部分。
 */
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
    scanned: usize,
}

impl LineBuffer {
    fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        match self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.scanned + offset;
                let raw = self.buf.drain(..=end).collect::<Vec<u8>>();
                self.scanned = 0;
                Some(decode_line(&raw))
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(decode_line(&self.buf))
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/**
 * \brief Poe Vendor：在 `PoeClient` 之上提供设置问题与统一 Vendor 接口。
 */
#[derive(Debug, Clone)]
pub struct PoeVendor {
    config: Configurable,
    api_key: QuestionId,
    base_url: QuestionId,
    client: PoeClient,
}

impl Default for PoeVendor {
    fn default() -> Self {
        Self::new()
    }
}

impl PoeVendor {
    pub fn new() -> Self {
        let mut config = Configurable::new(VENDOR_NAME);
        let api_key = config.add_setup_question("API key", true);
        let base_url = config.add_setup_question_with_default("Base URL", false, DEFAULT_BASE_URL);
        Self {
            config,
            api_key,
            base_url,
            client: PoeClient::new(DEFAULT_BASE_URL),
        }
    }

    /** \brief 直接设置凭证，跳过设置问题流程。 */
    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.config.set_value(self.api_key, api_key);
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.set_value(self.base_url, base_url);
        self.client.set_base_url(base_url);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.client = self.client.with_timeouts(timeouts);
        self
    }

    pub fn client(&self) -> &PoeClient {
        &self.client
    }

    fn api_key(&self) -> &str {
        self.config.value(self.api_key)
    }

    fn check_request(messages: &[Message], options: &ChatOptions) -> Result<(), VendorError> {
        if messages.is_empty() {
            return Err(VendorError::InvalidInput("no messages to send".to_string()));
        }
        if options.model.trim().is_empty() {
            return Err(VendorError::InvalidInput("model name is empty".to_string()));
        }
        Ok(())
    }
}

impl HasSetupQuestions for PoeVendor {
    fn name(&self) -> &str {
        &self.config.label
    }

    fn setup_questions(&self) -> &[SetupQuestion] {
        self.config.questions()
    }

    fn configure(&mut self, settings: &Settings) -> Result<(), ConfigError> {
        let result = self.config.configure(settings);
        let base_url = self.config.value(self.base_url).to_string();
        self.client.set_base_url(&base_url);
        result
    }
}

#[async_trait]
impl SupportsListModels for PoeVendor {
    async fn list_models(&self) -> Result<Vec<String>, VendorError> {
        self.client.list_models().await
    }
}

#[async_trait]
impl SupportsSend for PoeVendor {
    async fn send(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<String, VendorError> {
        Self::check_request(messages, options)?;
        telemetry::log_event(
            "poe.send",
            &format!("model={} msgs={}", options.model, messages.len()),
        );
        self.client
            .send_messages(self.api_key(), &options.model, messages)
            .await
            .inspect_err(|e| telemetry::log_error("poe.send", &e.to_string()))
    }
}

#[async_trait]
impl SupportsSendStream for PoeVendor {
    async fn send_stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), VendorError> {
        if let Err(e) = Self::check_request(messages, options) {
            sink.close(Some(e.to_string())).await;
            return Err(e);
        }
        telemetry::log_event(
            "poe.stream",
            &format!("model={} msgs={}", options.model, messages.len()),
        );
        self.client
            .send_stream(self.api_key(), &options.model, messages, sink)
            .await
            .inspect_err(|e| telemetry::log_error("poe.stream", &e.to_string()))
    }
}
