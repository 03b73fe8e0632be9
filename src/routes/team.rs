//! Referral tree routes
//!
//! - GET /team/upline?depth - sponsors, nearest first
//! - GET /team/downline?depth - referrals grouped by level

use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;

use crate::routes::common::{method_not_allowed, not_found_response, respond, FullBody, QueryParams};
use crate::server::{AppState, Session};

pub async fn handle_team_request(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    let query = QueryParams::from_query_string(req.uri().query());
    let depth = query.parse::<usize>(&["depth", "levels"]);
    let user_id = session.user.id.as_str();

    match (req.method(), subpath) {
        (&Method::GET, "/upline") => respond(StatusCode::OK, state.team.upline(user_id, depth).await),
        (&Method::GET, "/downline") => {
            respond(StatusCode::OK, state.team.downline(user_id, depth).await)
        }
        (_, "/upline") | (_, "/downline") => method_not_allowed(),
        _ => not_found_response(&format!("/team{subpath}")),
    }
}
