use anyhow::{Context, Result};
use frame_proto::{Header, decode_header_json, encode_header_json, read_frame_async, write_frame_async};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::admin::{
    AdminResponse, DeregisterRequest, HeartbeatRequest, ProcessorIdRequest, ProcessorSummary,
    RegisterRequest, RegisterResponse, ReplayRequest,
};
use super::registry::{ProcessorState, RegistryError};
use crate::app::AppState;

const MAX_HEADER_LEN: u32 = 64 * 1024;
const MAX_BODY_LEN: u64 = 4 * 1024 * 1024;
const SERVER_IDENTITY: &str = "frame-orchestrator";

/// Runs the control-plane TCP loop and spawns one task per accepted client.
/// Workers use it to register/heartbeat/deregister; the admin CLI uses it
/// for list/drain/evict/replay (spec §5).
pub async fn run_control_server(listen: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind control listener on {listen}"))?;

    info!(listen, "control server listening");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("control server stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("control server accept failed")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, state).await {
                        warn!(%peer, error = %err, "control client session failed");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_client(mut stream: TcpStream, state: AppState) -> Result<()> {
    let (header_bytes, body) = read_frame_async(&mut stream, MAX_HEADER_LEN, MAX_BODY_LEN)
        .await
        .context("failed to read control frame")?;
    let header = decode_header_json(&header_bytes).context("failed to decode control header")?;
    let kind = header.kind.as_deref().unwrap_or("");

    match kind {
        "register" => handle_register(&mut stream, &header, &body, &state).await,
        "heartbeat" => handle_heartbeat(&mut stream, &header, &body, &state).await,
        "deregister" => handle_deregister(&mut stream, &header, &body, &state).await,
        "list_processors" => handle_list_processors(&mut stream, &header, &state).await,
        "drain_processor" => handle_processor_action(&mut stream, &header, &body, &state, |s, id| s.registry.drain(id)).await,
        "evict_processor" => handle_processor_action(&mut stream, &header, &body, &state, |s, id| s.registry.evict(id)).await,
        "replay" => handle_replay(&mut stream, &header, &body, &state).await,
        other => {
            warn!(kind = other, "unrecognized control frame kind");
            respond_admin(&mut stream, &header, &AdminResponse::Rejected(format!("unknown kind: {other}"))).await
        }
    }
}

async fn handle_register(
    stream: &mut TcpStream,
    header: &Header,
    body: &[u8],
    state: &AppState,
) -> Result<()> {
    let request: RegisterRequest =
        serde_json::from_slice(body).context("failed to decode register request")?;
    let session_token = request.session_token;
    let outcome = state.registry.register(
        &request.processor_id,
        request.capabilities,
        request.declared_capacity,
        session_token.clone(),
    );

    if let Some(evicted_session) = &outcome.evicted_session {
        warn!(
            processor_id = %request.processor_id,
            evicted_session,
            "processor re-registered with a new session, prior session evicted"
        );
        state.metrics.incr("processor_sessions_evicted");
    }

    info!(
        processor_id = %request.processor_id,
        declared_capacity = request.declared_capacity,
        "processor registered"
    );

    respond(
        stream,
        header,
        "register_ok",
        &RegisterResponse { queue_name: outcome.queue_name, session_token },
    )
    .await
}

async fn handle_heartbeat(
    stream: &mut TcpStream,
    header: &Header,
    body: &[u8],
    state: &AppState,
) -> Result<()> {
    let request: HeartbeatRequest =
        serde_json::from_slice(body).context("failed to decode heartbeat request")?;
    let outcome = state.registry.heartbeat(
        &request.processor_id,
        &request.session_token,
        request.inflight_observed,
    );
    respond_admin(stream, header, &registry_result_to_admin(outcome)).await
}

async fn handle_deregister(
    stream: &mut TcpStream,
    header: &Header,
    body: &[u8],
    state: &AppState,
) -> Result<()> {
    let request: DeregisterRequest =
        serde_json::from_slice(body).context("failed to decode deregister request")?;
    let outcome = state.registry.deregister(&request.processor_id, &request.session_token);
    info!(processor_id = %request.processor_id, "processor deregistering");
    respond_admin(stream, header, &registry_result_to_admin(outcome)).await
}

async fn handle_list_processors(stream: &mut TcpStream, header: &Header, state: &AppState) -> Result<()> {
    let summaries: Vec<ProcessorSummary> = state
        .registry
        .snapshot_all()
        .into_iter()
        .map(|(snapshot, processor_state)| ProcessorSummary {
            processor_id: snapshot.processor_id,
            state: state_label(processor_state),
            capabilities: snapshot.capabilities,
            declared_capacity: snapshot.declared_capacity,
            inflight: snapshot.inflight,
        })
        .collect();

    respond(stream, header, "processor_list", &summaries).await
}

async fn handle_processor_action(
    stream: &mut TcpStream,
    header: &Header,
    body: &[u8],
    state: &AppState,
    action: impl FnOnce(&AppState, &str) -> Result<(), RegistryError>,
) -> Result<()> {
    let request: ProcessorIdRequest =
        serde_json::from_slice(body).context("failed to decode processor id request")?;
    let outcome = action(state, &request.processor_id);
    respond_admin(stream, header, &registry_result_to_admin(outcome)).await
}

async fn handle_replay(
    stream: &mut TcpStream,
    header: &Header,
    body: &[u8],
    state: &AppState,
) -> Result<()> {
    let request: ReplayRequest =
        serde_json::from_slice(body).context("failed to decode replay request")?;

    let mut replayed = 0u32;
    for entry_id in &request.entry_ids {
        match state.log_client.read_by_id(&state.config.dlq_stream, entry_id).await {
            Ok(Some((_, fields))) => {
                if state
                    .log_client
                    .append(&state.config.upstream_stream, &fields)
                    .await
                    .is_ok()
                {
                    replayed += 1;
                }
            }
            Ok(None) => warn!(entry_id, "replay requested unknown dead-letter entry"),
            Err(err) => warn!(entry_id, error = %err, "replay lookup failed"),
        }
    }

    info!(requested = request.entry_ids.len(), replayed, "admin replay completed");
    respond_admin(stream, header, &AdminResponse::Ok).await
}

fn registry_result_to_admin(result: Result<(), RegistryError>) -> AdminResponse {
    match result {
        Ok(()) => AdminResponse::Ok,
        Err(RegistryError::UnknownProcessor) => {
            AdminResponse::Conflict("unknown processor".to_string())
        }
        Err(RegistryError::SessionMismatch) => {
            AdminResponse::Rejected("session token mismatch".to_string())
        }
    }
}

fn state_label(state: ProcessorState) -> &'static str {
    match state {
        ProcessorState::Registering => "registering",
        ProcessorState::Healthy => "healthy",
        ProcessorState::Unhealthy => "unhealthy",
        ProcessorState::Draining => "draining",
        ProcessorState::Evicted => "evicted",
    }
}

async fn respond<T: serde::Serialize>(
    stream: &mut TcpStream,
    request_header: &Header,
    kind: &str,
    payload: &T,
) -> Result<()> {
    let response_header = Header {
        from: SERVER_IDENTITY.to_string(),
        to: request_header.from.clone(),
        kind: Some(kind.to_string()),
        source: None,
    };
    let header_bytes = encode_header_json(&response_header).context("failed to encode response header")?;
    let body = serde_json::to_vec(payload).context("failed to encode response body")?;
    write_frame_async(stream, &header_bytes, &body)
        .await
        .context("failed to write response frame")
}

async fn respond_admin(stream: &mut TcpStream, request_header: &Header, response: &AdminResponse) -> Result<()> {
    respond(stream, request_header, "admin_response", response).await
}
