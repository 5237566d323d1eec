use crate::cluster::transport::{HeartbeatRequest, VoteRequest, VoteResponse};
use crate::error::{correlation_id, ControlError, ErrorResponse};
use crate::market::BandwidthRequest;
use crate::server::{ControlState, Orchestrator};
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response<T: Serialize>(status: u16, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

fn error_response(err: &ControlError, correlation_id: &str) -> Response<BoxBody> {
    json_response(
        ErrorResponse::http_status(err),
        &ErrorResponse::from_error(err, correlation_id),
    )
}

/// Run the control-plane API server with graceful shutdown.
///
/// When `shutdown` fires the server stops accepting and waits up to
/// `DRAIN_TIMEOUT` for in-flight connections before dropping them.
pub async fn run_api_server(
    listen: &str,
    orchestrator: Orchestrator,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: api listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: api: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: api: accept failed, error={}", e);
                continue;
            }
        };

        active_conns.fetch_add(1, Ordering::Relaxed);
        let orchestrator = orchestrator.clone();
        let active = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let orch = orchestrator.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let orch = orch.clone();
                async move { handle_api(req, orch).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: api: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase.
    let drain = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        info!(
            "server: api: drain timeout, {} connections still active",
            active_conns.load(Ordering::Relaxed)
        );
    }

    Ok(())
}

async fn handle_api(
    req: Request<Incoming>,
    orchestrator: Orchestrator,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let cid = correlation_id();

    let response = match (method.as_str(), path.as_str()) {
        ("POST", "/v1/allocations") => allocate(req, &orchestrator, &cid).await,
        ("GET", "/v1/allocations") => {
            let active = orchestrator.list_active_allocations();
            Ok(json_response(
                200,
                &serde_json::json!({ "allocations": active, "correlation_id": cid }),
            ))
        }
        ("GET", "/v1/capacity") => {
            let capacity = orchestrator.capacity();
            let by_band: serde_json::Map<String, serde_json::Value> = capacity
                .into_iter()
                .map(|(band, (total, free))| {
                    (
                        band,
                        serde_json::json!({ "total_mbps": total, "free_mbps": free }),
                    )
                })
                .collect();
            Ok(json_response(
                200,
                &serde_json::json!({ "bands": by_band, "correlation_id": cid }),
            ))
        }
        ("POST", _) if path.starts_with("/v1/allocations/") && path.ends_with("/renew") => {
            renew(req, &orchestrator, &path, &cid).await
        }
        ("DELETE", _) if path.starts_with("/v1/allocations/") => {
            release(req, &orchestrator, &path, &cid).await
        }
        ("GET", _) if path.starts_with("/v1/nodes/") => {
            Ok(json_response(200, &orchestrator.node_status()))
        }
        ("GET", "/v1/cluster/health") => {
            Ok(json_response(200, &orchestrator.system_health().await))
        }
        ("POST", "/v1/cluster/vote") => vote(req, orchestrator.state()).await,
        ("POST", "/v1/cluster/heartbeat") => heartbeat(req, orchestrator.state()).await,
        ("POST", "/v1/cluster/append") => append(req, orchestrator.state()).await,
        _ => Ok(json_response(
            404,
            &serde_json::json!({ "error": "not found", "correlation_id": cid }),
        )),
    };

    match response {
        Ok(resp) => Ok(resp),
        Err(err) => Ok(error_response(&err, &cid)),
    }
}

fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<(T, Option<String>), ControlError> {
    let token = bearer_token(&req);
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ControlError::InvalidArgument(format!("body read: {}", e)))?
        .to_bytes();
    let value = serde_json::from_slice(&body)
        .map_err(|e| ControlError::InvalidArgument(format!("body parse: {}", e)))?;
    Ok((value, token))
}

async fn allocate(
    req: Request<Incoming>,
    orchestrator: &Orchestrator,
    cid: &str,
) -> Result<Response<BoxBody>, ControlError> {
    let (request, token): (BandwidthRequest, _) = read_json(req).await?;
    let ctx = crate::server::OperationContext {
        tenant: request.tenant.clone(),
        token,
        correlation_id: cid.to_string(),
    };
    let decision = orchestrator.allocate_bandwidth(&ctx, request).await?;
    let status = if decision.accepted { 200 } else { 409 };
    Ok(json_response(
        status,
        &serde_json::json!({
            "accepted": decision.accepted,
            "allocation": decision.allocation,
            "reason": decision.reason,
            "correlation_id": cid,
        }),
    ))
}

async fn release(
    req: Request<Incoming>,
    orchestrator: &Orchestrator,
    path: &str,
    cid: &str,
) -> Result<Response<BoxBody>, ControlError> {
    let allocation_id = path
        .trim_start_matches("/v1/allocations/")
        .trim_end_matches('/')
        .to_string();
    let token = bearer_token(&req);
    let tenant = orchestrator
        .state()
        .market
        .get(&allocation_id)
        .map(|a| a.tenant)
        .unwrap_or_default();
    let ctx = crate::server::OperationContext {
        tenant,
        token,
        correlation_id: cid.to_string(),
    };
    orchestrator.release_bandwidth(&ctx, &allocation_id).await?;
    Ok(json_response(
        200,
        &serde_json::json!({ "released": allocation_id, "correlation_id": cid }),
    ))
}

async fn renew(
    req: Request<Incoming>,
    orchestrator: &Orchestrator,
    path: &str,
    cid: &str,
) -> Result<Response<BoxBody>, ControlError> {
    #[derive(serde::Deserialize)]
    struct RenewBody {
        new_expiry_ms: u64,
    }
    let allocation_id = path
        .trim_start_matches("/v1/allocations/")
        .trim_end_matches("/renew")
        .to_string();
    let tenant = orchestrator
        .state()
        .market
        .get(&allocation_id)
        .map(|a| a.tenant)
        .unwrap_or_default();
    let (body, token): (RenewBody, _) = read_json(req).await?;
    let ctx = crate::server::OperationContext {
        tenant,
        token,
        correlation_id: cid.to_string(),
    };
    orchestrator
        .renew_bandwidth(&ctx, &allocation_id, body.new_expiry_ms)
        .await?;
    Ok(json_response(
        200,
        &serde_json::json!({ "renewed": allocation_id, "correlation_id": cid }),
    ))
}

// -- peer RPCs --

async fn vote(
    req: Request<Incoming>,
    state: &ControlState,
) -> Result<Response<BoxBody>, ControlError> {
    let (body, _): (VoteRequest, _) = read_json(req).await?;
    let granted = state
        .coordinator
        .handle_vote_request(&body.candidate_id, body.term);
    Ok(json_response(200, &VoteResponse { granted }))
}

async fn heartbeat(
    req: Request<Incoming>,
    state: &ControlState,
) -> Result<Response<BoxBody>, ControlError> {
    let (body, _): (HeartbeatRequest, _) = read_json(req).await?;
    state.coordinator.handle_heartbeat(body.from, body.lease);
    Ok(json_response(200, &serde_json::json!({ "ok": true })))
}

async fn append(
    req: Request<Incoming>,
    state: &ControlState,
) -> Result<Response<BoxBody>, ControlError> {
    let (record, _): (crate::cluster::ReplicatedRecord, _) = read_json(req).await?;
    state.coordinator.handle_append(record).await?;
    Ok(json_response(200, &serde_json::json!({ "ok": true })))
}

// -- admin listener --

/// Run the admin server for liveness, readiness and metrics.
pub async fn run_admin_server(listen: &str, state: ControlState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}

fn handle_admin(
    req: Request<Incoming>,
    state: ControlState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let overall = state.health.overall();
            let ready = !matches!(overall, crate::health::HealthLevel::Failed);
            Ok(Response::builder()
                .status(if ready { 200 } else { 503 })
                .body(full_body(format!(
                    r#"{{"status":"{}","role":"{}","term":{}}}"#,
                    overall.as_str(),
                    state.coordinator.role().as_str(),
                    state.coordinator.current_term(),
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/cluster" => {
            let nodes = state.coordinator.nodes_snapshot();
            let body = serde_json::to_string_pretty(&nodes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
