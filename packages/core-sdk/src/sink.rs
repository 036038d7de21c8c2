use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;

/**
 * \brief 通道中传递的流事件；结束信号显式给出，而不是依赖通道关闭。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Failed(String),
}

/** \brief 消费端已不再接收数据。 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("chunk sink is closed")]
pub struct SinkClosed;

/**
 * \brief 消费端看到的流失败原因。
 */
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamFailure {
    #[error("stream failed: {0}")]
    Failed(String),
    #[error("stream ended without a completion signal")]
    Incomplete,
}

/**
 * \brief 流式输出的写入端：逐块写入，并以 close 显式结束。
 * \details close 只生效一次；之后的 push 返回 `SinkClosed`。调用方可能在超时后放弃 close，
 * 实现需保证此时消费端仍能察觉流已结束。
 */
#[async_trait]
pub trait ChunkSink: Send {
    async fn push(&mut self, chunk: String) -> Result<(), SinkClosed>;

    /** \brief 结束流；`failure` 为 None 表示正常读到末尾。 */
    async fn close(&mut self, failure: Option<String>);
}

/**
 * \brief 基于有界 mpsc 通道的 sink 实现。
 */
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn push(&mut self, chunk: String) -> Result<(), SinkClosed> {
        let tx = self.tx.as_ref().ok_or(SinkClosed)?;
        tx.send(StreamEvent::Chunk(chunk))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn close(&mut self, failure: Option<String>) {
        if let Some(tx) = self.tx.take() {
            let event = match failure {
                Some(msg) => StreamEvent::Failed(msg),
                None => StreamEvent::Done,
            };
            // 接收端可能已丢弃，此时无需通知；若此 future 被取消，tx 随之释放，接收端看到 Incomplete
            let _ = tx.send(event).await;
        }
    }
}

/**
 * \brief 通道的读取端。
 */
#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl ChunkReceiver {
    /**
     * \brief 读取下一块。
     * \return `Some(Ok(chunk))`；失败时一次 `Some(Err(..))`；正常结束后恒为 `None`。
     */
    pub async fn recv(&mut self) -> Option<Result<String, StreamFailure>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Chunk(chunk)) => Some(Ok(chunk)),
            Some(StreamEvent::Done) => {
                self.finished = true;
                None
            }
            Some(StreamEvent::Failed(msg)) => {
                self.finished = true;
                Some(Err(StreamFailure::Failed(msg)))
            }
            None => {
                self.finished = true;
                Some(Err(StreamFailure::Incomplete))
            }
        }
    }

    /** \brief 读取全部块，遇到失败即返回。 */
    pub async fn collect(mut self) -> Result<Vec<String>, StreamFailure> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<String, StreamFailure>> + Send {
        async_stream::stream! {
            while let Some(item) = self.recv().await {
                yield item;
            }
        }
    }
}

/**
 * \brief 创建一对 sink/receiver，`capacity` 为通道缓冲块数（至少为 1）。
 */
pub fn chunk_channel(capacity: usize) -> (ChannelSink, ChunkReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink { tx: Some(tx) },
        ChunkReceiver {
            rx,
            finished: false,
        },
    )
}
