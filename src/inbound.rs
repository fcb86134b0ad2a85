//! 外部消息入口：订阅消息提供方的 SSE 推送流
//!
//! 消息提供方（如 Telegram MCP）把收到的用户消息以 JSON-RPC 通知
//! `notifications/message` 推到事件流上，`params.data` 里带 `chat_id` 与 `text`。
//! 每条带文本的通知转为一个 InboundMessage；其它事件（endpoint、心跳等）忽略。
//! 事件流断开后按固定间隔重连，直到取消。

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 一条待处理的外部消息；chat_id 即会话 id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: String,
    pub text: String,
}

#[derive(Error, Debug)]
pub enum InboundError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event stream returned status {0}")]
    Status(u16),
}

/// 从通知负载中取出 chat_id 与文本；缺任一项返回 None
pub fn extract_message(payload: &Value) -> Option<InboundMessage> {
    let data = payload.get("params")?.get("data")?;
    let text = data.get("text")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    let chat_id = match data.get("chat_id")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(InboundMessage {
        chat_id,
        text: text.to_string(),
    })
}

/// 增量 SSE 解码：按行切分，空行结束一个事件，返回各事件的 data
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: String,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(std::mem::take(&mut self.data));
                }
                continue;
            }
            // 注释 / 心跳
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        events
    }
}

pub struct SseListener {
    client: reqwest::Client,
    url: String,
    reconnect_delay: Duration,
}

impl SseListener {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Result<Self, InboundError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            reconnect_delay,
        })
    }

    /// 持续订阅并把消息送入 tx，直到 cancel 或接收端关闭
    pub async fn run(&self, tx: mpsc::Sender<InboundMessage>, cancel: CancellationToken) {
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return,
                res = self.stream_once(&tx) => res,
            };
            match res {
                Ok(()) => tracing::info!(url = %self.url, "inbound event stream closed"),
                Err(e) => tracing::warn!(url = %self.url, error = %e, "inbound event stream failed"),
            }
            if tx.is_closed() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn stream_once(&self, tx: &mpsc::Sender<InboundMessage>) -> Result<(), InboundError> {
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(InboundError::Status(resp.status().as_u16()));
        }
        tracing::info!(url = %self.url, "subscribed to inbound event stream");

        let mut decoder = SseDecoder::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for data in decoder.feed(&chunk) {
                let Ok(payload) = serde_json::from_str::<Value>(&data) else {
                    tracing::debug!(data = %data, "non-JSON event ignored");
                    continue;
                };
                let Some(msg) = extract_message(&payload) else {
                    tracing::debug!(event = %payload, "event without message text ignored");
                    continue;
                };
                tracing::info!(chat_id = %msg.chat_id, "inbound message");
                if tx.send(msg).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_extract_telegram_notification() {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {"level": "info", "data": {"chat_id": 5512, "text": " find flights ", "username": "ana"}}
        });
        assert_eq!(
            extract_message(&payload),
            Some(InboundMessage {
                chat_id: "5512".into(),
                text: "find flights".into()
            })
        );
    }

    #[test]
    fn test_extract_requires_text_and_chat() {
        assert_eq!(extract_message(&json!({"params": {"data": {"chat_id": 1}}})), None);
        assert_eq!(extract_message(&json!({"params": {"data": {"text": "hi"}}})), None);
        assert_eq!(
            extract_message(&json!({"params": {"data": {"chat_id": 1, "text": "  "}}})),
            None
        );
        assert_eq!(extract_message(&json!({"result": {}})), None);
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut d = SseDecoder::default();
        assert!(d.feed(b"event: endpoint\r\ndata: /messages/?session_id=1\r\n").is_empty());
        assert_eq!(d.feed(b"\r\n: ping\n\ndata: {\"a\":"), vec!["/messages/?session_id=1"]);
        assert!(d.feed(b"1}").is_empty());
        assert_eq!(d.feed(b"\n\n"), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_decoder_joins_multiline_data() {
        let mut d = SseDecoder::default();
        assert_eq!(d.feed("data: 你好\ndata: world\n\n".as_bytes()), vec!["你好\nworld"]);
    }

    /// 每个连接推一条消息后断开，验证转发与重连
    #[tokio::test]
    async fn test_listener_forwards_messages_across_reconnects() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = server.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut req = Vec::new();
                let mut buf = [0u8; 1024];
                while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(k) => req.extend_from_slice(&buf[..k]),
                    }
                }
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {"level": "info", "data": {"chat_id": 100 + n, "text": format!("hello {n}")}}
                });
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n\
                     event: endpoint\ndata: /messages/?session_id={n}\n\n: ping\n\ndata: {notification}\n\n"
                );
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });

        let listener =
            SseListener::new(format!("http://{addr}/telegram_mcp_sse/"), Duration::from_millis(20)).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { listener.run(tx, cancel).await }
        });

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.chat_id, "100");
        assert_eq!(first.text, "hello 0");

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.chat_id, "101");
        assert!(accepted.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
