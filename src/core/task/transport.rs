//! 网络传输层
//!
//! `Transport` 把"发起一次 GET 并逐块交付响应体"抽象出来，
//! 传输执行器只依赖这个 trait。`HttpTransport` 基于 reqwest，
//! 在工作线程上通过共享的 tokio 运行时 `block_on` 执行。

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::core::error::DownloadError;

/// 数据块回调的返回值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkControl {
    Continue,
    Stop,
}

/// 接收响应体的一方
pub trait ChunkSink {
    /// 响应头到达，`total` 为 Content-Length（未知时为 None）
    fn begin(&mut self, total: Option<u64>);

    /// 每个数据块到达时调用，返回 `Stop` 会中止传输
    fn chunk(&mut self, data: &[u8]) -> Result<ChunkControl, DownloadError>;
}

pub trait Transport: Send + Sync {
    /// 执行一次请求；非 2xx 状态返回 `ServerError`，被 sink 中止时返回 `Cancelled`
    fn fetch(&self, url: &str, sink: &mut dyn ChunkSink) -> Result<(), DownloadError>;
}

/// 基于 reqwest 的 HTTP 传输
pub struct HttpTransport {
    client: Client,
    runtime: Runtime,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| DownloadError::ConfigError(format!("无法创建 HTTP 客户端: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cachedown-io")
            .enable_all()
            .build()?;

        Ok(Self { client, runtime })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, sink: &mut dyn ChunkSink) -> Result<(), DownloadError> {
        self.runtime.block_on(async {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::ServerError(status.as_u16()));
            }

            sink.begin(response.content_length());

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk: Bytes = chunk?;
                if sink.chunk(&chunk)? == ChunkControl::Stop {
                    return Err(DownloadError::Cancelled);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! 测试用的桩传输：按 URL 返回预设响应并记录调用次数

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    pub enum StubResponse {
        Body(Bytes),
        Status(u16),
        Fail(String),
        /// 先睡眠再返回响应体
        Slow(Duration, Bytes),
    }

    #[derive(Default)]
    pub struct StubTransport {
        responses: Mutex<HashMap<String, StubResponse>>,
        calls: Mutex<HashMap<String, usize>>,
        chunk_size: usize,
    }

    impl StubTransport {
        pub fn new() -> Self {
            Self {
                chunk_size: 4,
                ..Default::default()
            }
        }

        pub fn respond(&self, url: &str, response: StubResponse) {
            self.responses.lock().unwrap().insert(url.to_string(), response);
        }

        pub fn body(&self, url: &str, body: &'static [u8]) {
            self.respond(url, StubResponse::Body(Bytes::from_static(body)));
        }

        pub fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }

        fn deliver(&self, body: &Bytes, sink: &mut dyn ChunkSink) -> Result<(), DownloadError> {
            sink.begin(Some(body.len() as u64));
            for piece in body.chunks(self.chunk_size.max(1)) {
                if sink.chunk(piece)? == ChunkControl::Stop {
                    return Err(DownloadError::Cancelled);
                }
            }
            Ok(())
        }
    }

    impl Transport for StubTransport {
        fn fetch(&self, url: &str, sink: &mut dyn ChunkSink) -> Result<(), DownloadError> {
            *self.calls.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
            let response = self.responses.lock().unwrap().get(url).cloned();
            match response {
                Some(StubResponse::Body(body)) => self.deliver(&body, sink),
                Some(StubResponse::Slow(delay, body)) => {
                    std::thread::sleep(delay);
                    self.deliver(&body, sink)
                }
                Some(StubResponse::Status(code)) => Err(DownloadError::ServerError(code)),
                Some(StubResponse::Fail(message)) => Err(DownloadError::NetworkError(message)),
                None => Err(DownloadError::ServerError(404)),
            }
        }
    }
}
