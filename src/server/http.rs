//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Routing is a plain match
//! on method and path prefix; each prefix hands its subpath to a route module.

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::auth::{required_permission, PermissionLevel};
use crate::routes::{self, FullBody};
use crate::server::{authorize, AppState};
use crate::types::{Result, UplineError};

/// Accept connections until the process exits
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Upline listening on {} (storage: {})",
        state.args.listen,
        state.storage.as_str()
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - do not use with real funds");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<FullBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    if method == Method::OPTIONS {
        return Ok(routes::preflight_response());
    }

    let timeout = state.args.request_timeout();
    let response = match tokio::time::timeout(timeout, route(req, &path, state)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(%method, %path, "Request timed out after {:?}", timeout);
            routes::error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Request timed out",
                "TIMEOUT",
            )
        }
    };

    info!(
        "[{}] {} {} -> {}",
        addr,
        method,
        path,
        response.status().as_u16()
    );
    Ok(response)
}

async fn route(req: Request<Incoming>, path: &str, state: Arc<AppState>) -> Response<FullBody> {
    let method = req.method().clone();
    match (&method, path) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            return routes::health_check(state)
        }
        (&Method::GET, "/version") => return routes::version_info(),
        (&Method::GET, "/plan") => return routes::plan_info(&state.plan),
        (&Method::POST, "/auth/signup") => return routes::handle_signup(req, state).await,
        (&Method::POST, "/auth/login") => return routes::handle_login(req, state).await,
        (_, "/health") | (_, "/healthz") | (_, "/version") | (_, "/plan") | (_, "/auth/signup")
        | (_, "/auth/login") => return routes::method_not_allowed(),
        _ => {}
    }

    let required = required_permission(path);
    if required == PermissionLevel::Public {
        return routes::not_found_response(path);
    }

    let auth_header = routes::get_auth_header(&req).map(str::to_string);
    let session = match authorize(&state, auth_header.as_deref(), required).await {
        Ok(session) => session,
        Err(e) => {
            if matches!(e, UplineError::Forbidden(_)) {
                warn!(path, "Forbidden: {}", e);
            }
            return routes::error_from(e);
        }
    };

    if let Some(subpath) = path.strip_prefix("/auth") {
        routes::handle_auth_request(req, subpath, state, session).await
    } else if let Some(subpath) = path.strip_prefix("/account") {
        routes::handle_account_request(req, subpath, state, session).await
    } else if let Some(subpath) = path.strip_prefix("/team") {
        routes::handle_team_request(req, subpath, state, session).await
    } else if let Some(subpath) = path.strip_prefix("/withdrawals") {
        routes::handle_withdrawal_request(req, subpath, state, session).await
    } else if let Some(subpath) = path.strip_prefix("/admin") {
        routes::handle_admin_request(req, subpath, state, session).await
    } else {
        routes::not_found_response(path)
    }
}
