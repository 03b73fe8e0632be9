//! Member withdrawal routes
//!
//! - GET /withdrawals?page&limit - own requests, newest first
//! - POST /withdrawals - hold funds and open a request
//! - GET /withdrawals/quote?amount - fee breakdown without side effects
//! - GET /withdrawals/{id}
//! - POST /withdrawals/{id}/cancel - only while pending

use bson::DateTime;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::routes::common::{
    error_from, method_not_allowed, not_found_response, parse_json_body, path_id, respond,
    FullBody, QueryParams,
};
use crate::routes::views::WithdrawalView;
use crate::server::{AppState, Session};
use crate::types::{Amount, UplineError};

#[derive(Debug, Deserialize)]
pub struct WithdrawalRequest {
    /// Gross cents, fee included
    pub amount: Amount,
    /// Falls back to the profile's payout address
    #[serde(default)]
    pub destination: Option<String>,
}

pub async fn handle_withdrawal_request(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    let user_id = session.user.id.as_str();
    let method = req.method().clone();
    let query = QueryParams::from_query_string(req.uri().query());

    match (&method, subpath) {
        (&Method::GET, "") | (&Method::GET, "/") => respond(
            StatusCode::OK,
            state
                .withdrawals
                .list_for(user_id, query.page())
                .await
                .map(|page| page.map(|w| WithdrawalView::from(&w))),
        ),
        (&Method::POST, "") | (&Method::POST, "/") => {
            let request: WithdrawalRequest = match parse_json_body(req).await {
                Ok(r) => r,
                Err(e) => return error_from(e),
            };
            respond(
                StatusCode::CREATED,
                state
                    .withdrawals
                    .request(user_id, request.amount, request.destination, DateTime::now())
                    .await
                    .map(|w| WithdrawalView::from(&w)),
            )
        }
        (&Method::GET, "/quote") => match query.parse::<i64>(&["amount"]) {
            Some(cents) => respond(
                StatusCode::OK,
                state.withdrawals.quote(Amount::from_cents(cents)),
            ),
            None => error_from(UplineError::BadRequest(
                "amount query parameter (cents) is required".into(),
            )),
        },
        (_, "") | (_, "/") | (_, "/quote") => method_not_allowed(),
        _ => {
            if let Some(id) = path_id(subpath, Some("cancel")) {
                if method != Method::POST {
                    return method_not_allowed();
                }
                return respond(
                    StatusCode::OK,
                    state
                        .withdrawals
                        .cancel(user_id, id, DateTime::now())
                        .await
                        .map(|w| WithdrawalView::from(&w)),
                );
            }
            if let Some(id) = path_id(subpath, None) {
                if method != Method::GET {
                    return method_not_allowed();
                }
                return respond(
                    StatusCode::OK,
                    state
                        .withdrawals
                        .get_for(user_id, id)
                        .await
                        .map(|w| WithdrawalView::from(&w)),
                );
            }
            not_found_response(&format!("/withdrawals{subpath}"))
        }
    }
}
