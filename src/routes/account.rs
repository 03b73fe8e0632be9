//! Member account routes
//!
//! - GET/PUT /account/profile
//! - GET /account/transactions?page&limit
//! - GET /account/incomes?kind&page&limit
//! - GET /account/pool, POST /account/pool/claim
//! - POST /account/activate
//! - POST /account/transfer

use bson::DateTime;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::db::schemas::IncomeKind;
use crate::income::Rank;
use crate::routes::common::{
    error_from, json_response, method_not_allowed, not_found_response, parse_json_body, respond,
    FullBody, QueryParams,
};
use crate::routes::views::{IncomeView, PoolView, TransactionView, UserView};
use crate::server::{AppState, Session};
use crate::types::{Amount, UplineError};
use crate::wallet::ProfileUpdate;

#[derive(Debug, Default, Deserialize)]
pub struct ActivateRequest {
    /// Must be the member's next rank when given
    #[serde(default)]
    pub rank: Option<Rank>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub to_referral_code: String,
    /// Cents
    pub amount: Amount,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn handle_account_request(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    let user_id = session.user.id.as_str();
    let query = QueryParams::from_query_string(req.uri().query());

    match (req.method().clone(), subpath) {
        (Method::GET, "/profile") => json_response(StatusCode::OK, &UserView::from(&session.user)),
        (Method::PUT, "/profile") => {
            let update: ProfileUpdate = match parse_json_body(req).await {
                Ok(u) => u,
                Err(e) => return error_from(e),
            };
            respond(
                StatusCode::OK,
                state
                    .wallet
                    .update_profile(user_id, update)
                    .await
                    .map(|u| UserView::from(&u)),
            )
        }
        (Method::GET, "/transactions") => respond(
            StatusCode::OK,
            state
                .ledger
                .transactions_for(user_id, query.page())
                .await
                .map(|page| page.map(|tx| TransactionView::from(&tx))),
        ),
        (Method::GET, "/incomes") => {
            let kind = match query.get(&["kind", "type"]) {
                Some(raw) => match raw.parse::<IncomeKind>() {
                    Ok(kind) => Some(kind),
                    Err(e) => return error_from(UplineError::BadRequest(e)),
                },
                None => None,
            };
            respond(
                StatusCode::OK,
                state
                    .ledger
                    .incomes_for(user_id, kind, query.page())
                    .await
                    .map(|page| page.map(|income| IncomeView::from(&income))),
            )
        }
        (Method::GET, "/pool") => respond(
            StatusCode::OK,
            state.pool.summary(user_id).await.map(|s| PoolView::from(&s)),
        ),
        (Method::POST, "/pool/claim") => {
            respond(StatusCode::OK, state.pool.claim(user_id, DateTime::now()).await)
        }
        (Method::POST, "/activate") => {
            let request: ActivateRequest = match parse_json_body(req).await {
                Ok(r) => r,
                Err(e) => return error_from(e),
            };
            respond(
                StatusCode::CREATED,
                state
                    .wallet
                    .activate(user_id, request.rank, DateTime::now())
                    .await,
            )
        }
        (Method::POST, "/transfer") => {
            let request: TransferRequest = match parse_json_body(req).await {
                Ok(r) => r,
                Err(e) => return error_from(e),
            };
            respond(
                StatusCode::CREATED,
                state
                    .wallet
                    .transfer(
                        user_id,
                        &request.to_referral_code,
                        request.amount,
                        request.note,
                        DateTime::now(),
                    )
                    .await
                    .map(|tx| TransactionView::from(&tx)),
            )
        }
        (_, "/profile")
        | (_, "/transactions")
        | (_, "/incomes")
        | (_, "/pool")
        | (_, "/pool/claim")
        | (_, "/activate")
        | (_, "/transfer") => method_not_allowed(),
        _ => not_found_response(&format!("/account{subpath}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::common::decode_json;

    #[test]
    fn test_transfer_body_in_cents() {
        let body: TransferRequest =
            decode_json(br#"{"toReferralCode":"UPABC123","amount":2550}"#).unwrap();
        assert_eq!(body.to_referral_code, "UPABC123");
        assert_eq!(body.amount, Amount::from_cents(2550));
        assert!(body.note.is_none());
    }

    #[test]
    fn test_activate_body() {
        let body: ActivateRequest = decode_json(b"{}").unwrap();
        assert!(body.rank.is_none());
        let body: ActivateRequest = decode_json(br#"{"rank":"benitoite"}"#).unwrap();
        assert_eq!(body.rank, Some(Rank::Benitoite));
    }
}
