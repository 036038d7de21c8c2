use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::{ConfigError, SetupQuestion, Settings};
use crate::models::{ChatOptions, Message};
use crate::sink::ChunkSink;

/**
 * \brief 发往代理服务的三类操作，用于在错误信息中标注失败位置。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListModels,
    Send,
    SendStream,
}

impl Operation {
    /** \brief 对应的代理端点路径。 */
    pub fn path(&self) -> &'static str {
        match self {
            Operation::ListModels => "/ListModels",
            Operation::Send => "/Send",
            Operation::SendStream => "/SendStream",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ListModels => "ListModels",
            Operation::Send => "Send",
            Operation::SendStream => "SendStream",
        };
        f.write_str(name)
    }
}

/**
 * \brief Vendor 调用可能出现的错误；所有变体都带有失败的操作名，均不做本地重试。
 */
#[derive(Debug, thiserror::Error)]
pub enum VendorError {
    #[error("failed to create {op} request: {source}")]
    Request {
        op: Operation,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to marshal {op} payload: {source}")]
    Encode {
        op: Operation,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to send {op} request: {source}")]
    Transport {
        op: Operation,
        #[source]
        source: reqwest::Error,
    },

    #[error("received non-OK {op} response: {status}")]
    Status { op: Operation, status: StatusCode },

    #[error("failed to read {op} response body: {source}")]
    Body {
        op: Operation,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse {op} response: {source}")]
    Decode {
        op: Operation,
        #[source]
        source: serde_json::Error,
    },

    #[error("error reading {op} response stream: {source}")]
    StreamRead {
        op: Operation,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: Operation, timeout: Duration },

    #[error("stream consumer dropped before {op} finished")]
    SinkClosed { op: Operation },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VendorError {
    /** \brief 非 2xx 响应时返回状态码。 */
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            VendorError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /** \brief 出错的操作（配置与入参错误不属于任何 HTTP 操作）。 */
    pub fn operation(&self) -> Option<Operation> {
        match self {
            VendorError::Request { op, .. }
            | VendorError::Encode { op, .. }
            | VendorError::Transport { op, .. }
            | VendorError::Status { op, .. }
            | VendorError::Body { op, .. }
            | VendorError::Decode { op, .. }
            | VendorError::StreamRead { op, .. }
            | VendorError::Timeout { op, .. }
            | VendorError::SinkClosed { op } => Some(*op),
            VendorError::InvalidInput(_) | VendorError::Config(_) => None,
        }
    }
}

/**
 * \brief 可通过设置问题完成配置的 Vendor。
 */
pub trait HasSetupQuestions {
    /** \brief Vendor 显示名称，同时决定环境变量前缀。 */
    fn name(&self) -> &str;

    fn setup_questions(&self) -> &[SetupQuestion];

    /** \brief 用给定配置回答所有设置问题，缺少必填项时报错。 */
    fn configure(&mut self, settings: &Settings) -> Result<(), ConfigError>;

    fn is_configured(&self) -> bool {
        self.setup_questions()
            .iter()
            .all(|q| !q.required || !q.value.is_empty())
    }
}

#[async_trait]
pub trait SupportsListModels {
    async fn list_models(&self) -> Result<Vec<String>, VendorError>;
}

#[async_trait]
pub trait SupportsSend {
    async fn send(&self, messages: &[Message], options: &ChatOptions)
        -> Result<String, VendorError>;
}

#[async_trait]
pub trait SupportsSendStream {
    /**
     * \brief 流式发送；结束时无论成功与否都会关闭 sink。
     */
    async fn send_stream(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        sink: &mut dyn ChunkSink,
    ) -> Result<(), VendorError>;
}

/**
 * \brief 编排层使用的统一 Vendor 接口，由各能力 trait 组合而成。
 */
pub trait Vendor:
    HasSetupQuestions + SupportsListModels + SupportsSend + SupportsSendStream + Send + Sync
{
}

impl<T> Vendor for T where
    T: HasSetupQuestions + SupportsListModels + SupportsSend + SupportsSendStream + Send + Sync
{
}
