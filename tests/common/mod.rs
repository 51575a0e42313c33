#![allow(dead_code)]

pub mod greeter;

use std::time::Duration;

use anyhow::{Context, bail};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// One parsed server-sent event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn json(&self) -> anyhow::Result<serde_json::Value> {
        serde_json::from_str(&self.data).context("event data is not JSON")
    }
}

/// Parse every complete event in an SSE body, skipping comments and
/// keep-alive pings.
pub fn parse_sse_events(text: &str) -> Vec<SseEvent> {
    let normalized = text.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .filter_map(|block| {
            let mut id = None;
            let mut event = None;
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("id:") {
                    id = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("event:") {
                    event = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.trim().to_string());
                }
            }
            if data.is_empty() {
                None
            } else {
                Some(SseEvent {
                    id,
                    event,
                    data: data.join("\n"),
                })
            }
        })
        .collect()
}

/// Feed a long-lived SSE response into a channel, one parsed event at a
/// time.
pub fn spawn_sse_reader(response: reqwest::Response) -> tokio::sync::mpsc::Receiver<SseEvent> {
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut emitted = 0usize;
        while let Some(Ok(bytes)) = stream.next().await {
            let Ok(chunk) = std::str::from_utf8(&bytes) else {
                break;
            };
            buffer.push_str(chunk);
            if let Some(end) = buffer.rfind("\n\n") {
                let events = parse_sse_events(&buffer[..end + 2]);
                for event in events.iter().skip(emitted) {
                    if tx.send(event.clone()).await.is_err() {
                        return;
                    }
                }
                emitted = events.len();
            }
        }
    });
    rx
}

/// Next event off a reader channel, bounded by a timeout.
pub async fn next_event(
    rx: &mut tokio::sync::mpsc::Receiver<SseEvent>,
) -> anyhow::Result<SseEvent> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("timed out waiting for SSE event")?
        .context("SSE stream ended")
}

/// Read from a live SSE response until `count` events arrived.
pub async fn read_sse_events(
    response: reqwest::Response,
    count: usize,
) -> anyhow::Result<Vec<SseEvent>> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let complete = match buffer.rfind("\n\n") {
            Some(end) => parse_sse_events(&buffer[..end + 2]),
            None => Vec::new(),
        };
        if complete.len() >= count {
            return Ok(complete.into_iter().take(count).collect());
        }
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .context("timed out waiting for SSE events")?;
        match chunk {
            Some(Ok(bytes)) => buffer.push_str(std::str::from_utf8(&bytes)?),
            Some(Err(error)) => bail!("stream error: {error}"),
            None => {
                let events = parse_sse_events(&buffer);
                if events.len() >= count {
                    return Ok(events.into_iter().take(count).collect());
                }
                bail!("stream ended after {} events, wanted {count}", events.len());
            }
        }
    }
}
