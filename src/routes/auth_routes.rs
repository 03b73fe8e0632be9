//! Authentication routes
//!
//! - POST /auth/signup - create a member (optionally under a sponsor) and sign in
//! - POST /auth/login - exchange credentials for a token
//! - POST /auth/refresh - fresh token for the current session
//! - GET /auth/me - the signed-in member

use bson::DateTime;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::auth::{JwtValidator, TokenInput};
use crate::db::schemas::UserDoc;
use crate::routes::common::{
    error_from, json_response, method_not_allowed, not_found_response, parse_json_body, FullBody,
};
use crate::routes::views::UserView;
use crate::server::{AppState, Session};
use crate::types::Result;
use crate::wallet::SignupRequest;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    /// Unix seconds
    pub expires_at: u64,
    pub user: UserView,
}

/// Sign a token carrying the member's current token version
pub fn issue_token(jwt: &JwtValidator, user: &UserDoc) -> Result<AuthResponse> {
    let token = jwt.generate_token(TokenInput {
        user_id: user.id.clone(),
        identifier: user.identifier.clone(),
        permission_level: user.permission_level,
        version: user.token_version,
    })?;
    let expires_at = jwt.verify_token(&token).into_claims()?.exp;

    Ok(AuthResponse {
        token,
        expires_at,
        user: UserView::from(user),
    })
}

/// POST /auth/signup
pub async fn handle_signup(req: Request<Incoming>, state: Arc<AppState>) -> Response<FullBody> {
    let request: SignupRequest = match parse_json_body(req).await {
        Ok(r) => r,
        Err(e) => return error_from(e),
    };

    let user = match state.wallet.signup(request, DateTime::now()).await {
        Ok(user) => user,
        Err(e) => return error_from(e),
    };

    match issue_token(&state.jwt, &user) {
        Ok(body) => json_response(StatusCode::CREATED, &body),
        Err(e) => error_from(e),
    }
}

/// POST /auth/login
pub async fn handle_login(req: Request<Incoming>, state: Arc<AppState>) -> Response<FullBody> {
    let request: LoginRequest = match parse_json_body(req).await {
        Ok(r) => r,
        Err(e) => return error_from(e),
    };

    let user = match state
        .wallet
        .authenticate(&request.identifier, &request.password)
        .await
    {
        Ok(user) => user,
        Err(e) => return error_from(e),
    };

    info!(user_id = %user.id, "Member signed in");
    match issue_token(&state.jwt, &user) {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => error_from(e),
    }
}

/// Signed-in routes under /auth
pub async fn handle_auth_request(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    match (req.method(), subpath) {
        (&Method::POST, "/refresh") => match issue_token(&state.jwt, &session.user) {
            Ok(body) => json_response(StatusCode::OK, &body),
            Err(e) => error_from(e),
        },
        (&Method::GET, "/me") => json_response(StatusCode::OK, &UserView::from(&session.user)),
        (_, "/refresh") | (_, "/me") => method_not_allowed(),
        _ => not_found_response(&format!("/auth{subpath}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_token_carries_version() {
        let jwt = JwtValidator::new_dev();
        let mut user = UserDoc::new(
            "t@example.com".into(),
            "T".into(),
            "hash".into(),
            "UPTTTTTT".into(),
            None,
        );
        user.token_version = 4;

        let response = issue_token(&jwt, &user).unwrap();
        let claims = jwt.verify_token(&response.token).into_claims().unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.version, 4);
        assert_eq!(claims.exp, response.expires_at);
        assert_eq!(response.user.referral_code, "UPTTTTTT");
    }
}
