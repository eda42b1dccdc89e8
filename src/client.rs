//! Frontend side of status sync
//!
//! [`StatusFollower`] keeps a [`StatusCache`] in step with a running
//! supervisor: it subscribes to the event stream, resynchronizes the full
//! instance list on every (re)connect and reconnects with backoff.

use crate::status::InstanceStatus;
use crate::sync::StatusCache;
use anyhow::{bail, Context as _};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Only the status of a listed instance matters here
#[derive(Debug, Deserialize)]
struct ListedInstance {
    status: InstanceStatus,
}

pub struct StatusFollower {
    base_url: String,
    cache: Arc<StatusCache>,
    client: Client<HttpConnector, Empty<Bytes>>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl StatusFollower {
    /// `base_url` is the supervisor address including any home prefix,
    /// e.g. `http://127.0.0.1:8080/ide`.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        base_url
            .parse::<Uri>()
            .with_context(|| format!("Invalid supervisor URL: {}", base_url))?;

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            base_url,
            cache: Arc::new(StatusCache::new()),
            client,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        })
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Accepted status updates, including synthesized ones
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceStatus> {
        self.cache.subscribe()
    }

    /// Follow the supervisor until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let mut delay = self.initial_backoff;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.follow(&mut delay) => result,
            };

            match result {
                Ok(()) => debug!(url = %self.base_url, "Status event stream ended"),
                Err(e) => warn!(url = %self.base_url, error = %e, "Status follower disconnected"),
            }

            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to supervisor");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.max_backoff);
        }

        debug!(url = %self.base_url, "Status follower stopped");
    }

    /// One connection lifetime: subscribe, reconcile, then apply events
    async fn follow(&self, delay: &mut Duration) -> anyhow::Result<()> {
        // Subscribe first so nothing between the listing and the stream is lost
        let events = self.client.get(self.endpoint("/api/events")?).await?;
        if events.status() != StatusCode::OK {
            bail!("event stream returned {}", events.status());
        }

        let live = self.fetch_live().await?;
        let vanished = self.cache.reconcile(&live);
        for status in &vanished {
            info!(instance_id = %status.instance_id, "Instance vanished while disconnected");
        }
        info!(
            url = %self.base_url,
            instances = live.len(),
            vanished = vanished.len(),
            "Status follower synchronized"
        );
        *delay = self.initial_backoff;

        let mut body = events.into_body();
        let mut parser = EventParser::default();
        while let Some(frame) = body.frame().await {
            let frame = frame?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            for event in parser.push(&data) {
                if event.event != "status" {
                    continue;
                }
                match serde_json::from_str::<InstanceStatus>(&event.data) {
                    Ok(status) => {
                        if !self.cache.apply(status) {
                            debug!("Discarded stale status update");
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed status event"),
                }
            }
        }

        Ok(())
    }

    async fn fetch_live(&self) -> anyhow::Result<Vec<InstanceStatus>> {
        let response = self.client.get(self.endpoint("/api/instances")?).await?;
        if response.status() != StatusCode::OK {
            bail!("instance listing returned {}", response.status());
        }
        let body = response.into_body().collect().await?.to_bytes();
        let listed: Vec<ListedInstance> =
            serde_json::from_slice(&body).context("Invalid instance listing")?;
        Ok(listed.into_iter().map(|i| i.status).collect())
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Uri> {
        format!("{}{}", self.base_url, path)
            .parse()
            .with_context(|| format!("Invalid endpoint {}{}", self.base_url, path))
    }
}

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    event: String,
    data: String,
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
struct EventParser {
    buf: Vec<u8>,
}

impl EventParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, sep)) = record_end(&self.buf) {
            let record: Vec<u8> = self.buf.drain(..end + sep).collect();
            if let Some(event) = parse_record(&String::from_utf8_lossy(&record[..end])) {
                events.push(event);
            }
        }

        events
    }
}

/// Position and length of the first blank-line separator
fn record_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_record(record: &str) -> Option<Event> {
    let mut event = String::from("message");
    let mut data: Vec<&str> = Vec::new();

    for line in record.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(Event {
        event,
        data: data.join("\n"),
    })
}
