//! Worker client library (spec §4.8): the piece a processor binary links
//! against to join the pool. It owns the control-plane handshake
//! (register/heartbeat/deregister against the orchestrator), and the
//! steady-state loop that reads frames off this processor's dedicated queue
//! and hands each to a caller-supplied [`FrameProcessor`].

mod wire;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use frame_proto::{FrameEnvelope, Header, encode_header_json, read_frame_async, write_frame_async};
use redis::Value;
use tokio::net::TcpStream;
use tokio::time::{Duration, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use wire::{DeregisterRequest, HeartbeatRequest, RegisterRequest, RegisterResponse};

const MAX_HEADER_LEN: u32 = 64 * 1024;
const MAX_BODY_LEN: u64 = 4 * 1024 * 1024;
const RETRY_ATTEMPTS: usize = 3;

#[async_trait]
pub trait FrameProcessor: Send + Sync {
    async fn process(&self, envelope: FrameEnvelope) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub orchestrator_addr: String,
    pub redis_url: String,
    pub processor_id: String,
    pub capabilities: HashSet<String>,
    pub declared_capacity: u32,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub queue_block_ms: u64,
}

pub struct WorkerClient {
    config: WorkerConfig,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Runs the worker until `shutdown` is cancelled: registers, starts the
    /// heartbeat task, then consumes the dedicated queue until told to stop,
    /// at which point it deregisters before returning.
    pub async fn run(&self, processor: Arc<dyn FrameProcessor>, shutdown: CancellationToken) -> Result<()> {
        let session_token = Uuid::new_v4().to_string();
        let registration = self.register_with_retry(&session_token).await?;
        info!(
            processor_id = %self.config.processor_id,
            queue_name = %registration.queue_name,
            "worker registered"
        );

        let inflight = Arc::new(AtomicU32::new(0));
        let heartbeat_task = tokio::spawn(run_heartbeat(
            self.config.clone(),
            registration.session_token.clone(),
            inflight.clone(),
            shutdown.clone(),
        ));

        let consume_result = self
            .consume_queue(&registration.queue_name, processor, inflight, shutdown.clone())
            .await;

        heartbeat_task.abort();

        if let Err(err) = self.deregister(&registration.session_token).await {
            warn!(error = %err, "deregister on shutdown failed");
        }

        consume_result
    }

    /// Retries register with the *same* `session_token` on every attempt, so
    /// a register that actually landed but whose response was lost doesn't
    /// look like a brand-new session to the orchestrator.
    async fn register_with_retry(&self, session_token: &str) -> Result<RegisterResponse> {
        let mut last_error = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.register_once(session_token).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(attempt, error = %err, "register attempt failed, retrying");
                    last_error = Some(err);
                    tokio::time::sleep(Duration::from_millis((attempt * 250) as u64)).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("register failed")))
    }

    async fn register_once(&self, session_token: &str) -> Result<RegisterResponse> {
        let mut stream = connect(&self.config).await?;
        let request = RegisterRequest {
            processor_id: self.config.processor_id.clone(),
            capabilities: self.config.capabilities.clone(),
            declared_capacity: self.config.declared_capacity,
            session_token: session_token.to_string(),
        };
        send_and_decode(&self.config, &mut stream, "register", &request).await
    }

    async fn deregister(&self, session_token: &str) -> Result<()> {
        let mut stream = connect(&self.config).await?;
        let request = DeregisterRequest {
            processor_id: self.config.processor_id.clone(),
            session_token: session_token.to_string(),
        };
        let _: serde_json::Value = send_and_decode(&self.config, &mut stream, "deregister", &request).await?;
        Ok(())
    }

    async fn consume_queue(
        &self,
        queue_name: &str,
        processor: Arc<dyn FrameProcessor>,
        inflight: Arc<AtomicU32>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let client = redis::Client::open(self.config.redis_url.as_str())
            .context("failed to build redis client")?;
        let mut conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;

        let mut last_id = "0".to_string();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let reply: Value = tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = redis::cmd("XREAD")
                    .arg("BLOCK")
                    .arg(self.config.queue_block_ms)
                    .arg("COUNT")
                    .arg(16_u32)
                    .arg("STREAMS")
                    .arg(queue_name)
                    .arg(&last_id)
                    .query_async(&mut conn) => reply.context("XREAD on dedicated queue failed")?,
            };

            let entries = wire::parse_xread_entries(&reply);
            if entries.is_empty() {
                continue;
            }

            for (entry_id, fields) in entries {
                last_id = entry_id.clone();
                inflight.fetch_add(1, Ordering::Relaxed);

                match FrameEnvelope::decode(&fields) {
                    Ok(envelope) => {
                        if let Err(err) = processor.process(envelope).await {
                            warn!(entry_id, error = %err, "frame processing failed");
                        }
                    }
                    Err(err) => warn!(entry_id, error = %err, "dropped malformed queue entry"),
                }

                let _: Result<i64, _> = redis::cmd("XDEL")
                    .arg(queue_name)
                    .arg(&entry_id)
                    .query_async(&mut conn)
                    .await;
                inflight.fetch_sub(1, Ordering::Relaxed);
            }
        }

        Ok(())
    }
}

async fn run_heartbeat(
    config: WorkerConfig,
    session_token: String,
    inflight: Arc<AtomicU32>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(config.heartbeat_interval.max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("heartbeat task stopping");
                break;
            }
            _ = ticker.tick() => {
                let request = HeartbeatRequest {
                    processor_id: config.processor_id.clone(),
                    session_token: session_token.clone(),
                    inflight_observed: Some(inflight.load(Ordering::Relaxed)),
                };

                let sent = async {
                    let mut stream = connect(&config).await?;
                    send_and_decode::<_, serde_json::Value>(&config, &mut stream, "heartbeat", &request).await
                }.await;

                if let Err(err) = sent {
                    warn!(error = %err, "heartbeat send failed");
                }
            }
        }
    }
}

async fn connect(config: &WorkerConfig) -> Result<TcpStream> {
    timeout(config.connect_timeout, TcpStream::connect(&config.orchestrator_addr))
        .await
        .with_context(|| format!("connect timeout to {}", config.orchestrator_addr))?
        .with_context(|| format!("connect failed to {}", config.orchestrator_addr))
}

async fn send_and_decode<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
    config: &WorkerConfig,
    stream: &mut TcpStream,
    kind: &str,
    request: &Req,
) -> Result<Resp> {
    let header = Header {
        from: config.processor_id.clone(),
        to: "frame-orchestrator".to_string(),
        kind: Some(kind.to_string()),
        source: None,
    };
    let header_bytes = encode_header_json(&header).context("failed to encode header")?;
    let body = serde_json::to_vec(request).context("failed to encode request body")?;

    timeout(config.io_timeout, write_frame_async(stream, &header_bytes, &body))
        .await
        .with_context(|| format!("write timeout for kind={kind}"))?
        .with_context(|| format!("failed to write frame for kind={kind}"))?;

    let (_, response_body) = timeout(
        config.io_timeout,
        read_frame_async(stream, MAX_HEADER_LEN, MAX_BODY_LEN),
    )
    .await
    .with_context(|| format!("read timeout for kind={kind}"))?
    .with_context(|| format!("failed to read response for kind={kind}"))?;

    serde_json::from_slice(&response_body).context("failed to decode response body")
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn test_config(addr: String) -> WorkerConfig {
        WorkerConfig {
            orchestrator_addr: addr,
            redis_url: "redis://127.0.0.1/".to_string(),
            processor_id: "p1".to_string(),
            capabilities: HashSet::new(),
            declared_capacity: 4,
            heartbeat_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            queue_block_ms: 1000,
        }
    }

    #[tokio::test]
    async fn register_once_decodes_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, _) = read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN).await.unwrap();

            let header = Header {
                from: "frame-orchestrator".to_string(),
                to: "p1".to_string(),
                kind: Some("register_ok".to_string()),
                source: None,
            };
            let header_bytes = encode_header_json(&header).unwrap();
            let body = serde_json::to_vec(&RegisterResponse {
                queue_name: "frames:processor:p1".to_string(),
                session_token: "tok-123".to_string(),
            })
            .unwrap();
            write_frame_async(&mut stream, &header_bytes, &body).await.unwrap();
        });

        let worker = WorkerClient::new(test_config(addr.to_string()));
        let response = worker.register_once("tok-123").await.unwrap();
        assert_eq!(response.queue_name, "frames:processor:p1");
        assert_eq!(response.session_token, "tok-123");
    }
}
