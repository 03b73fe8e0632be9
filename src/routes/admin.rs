//! Admin API endpoints
//!
//! ## Endpoints
//!
//! - `GET /admin/stats` - platform totals and rank pool balances
//! - `GET /admin/users?page&limit&search&rank&active` - member listing
//! - `GET /admin/users/{id}` - one member
//! - `PUT /admin/users/{id}/status` - block or unblock
//! - `POST /admin/users/{id}/topup` - credit available balance
//! - `POST /admin/users/{id}/force-logout` - invalidate issued tokens
//! - `GET /admin/withdrawals?status&userId&page&limit`
//! - `POST /admin/withdrawals/{id}/approve` - queue the payout
//! - `POST /admin/withdrawals/{id}/reject` - refund with a reason
//! - `GET /admin/payouts?page&limit` - payout queue, earliest due first
//! - `POST /admin/jobs/{payout-sweep|pool-accrual|distribute}` - run a job now
//!
//! Every route here is behind the admin permission check in the server.

use bson::DateTime;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::income::Rank;
use crate::ledger::{LedgerStats, UserQuery, WithdrawalQuery};
use crate::payout::Job;
use crate::routes::common::{
    error_from, method_not_allowed, not_found_response, parse_json_body, path_id, respond,
    FullBody, QueryParams,
};
use crate::routes::views::{PayoutView, RankPoolView, TransactionView, UserView, WithdrawalView};
use crate::server::{AppState, Session};
use crate::types::{Amount, Result, UplineError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct TopupRequest {
    /// Cents
    pub amount: Amount,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    #[serde(flatten)]
    pub ledger: LedgerStats,
    pub rank_pools: Vec<RankPoolView>,
}

fn parse_filter<T: std::str::FromStr<Err = String>>(
    query: &QueryParams,
    keys: &[&str],
) -> Result<Option<T>> {
    query
        .get(keys)
        .map(|raw| raw.parse::<T>().map_err(UplineError::BadRequest))
        .transpose()
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(UplineError::BadRequest(format!("not a boolean: {other}"))),
    }
}

/// Build the member listing filter from the query string
pub fn user_query(query: &QueryParams) -> Result<UserQuery> {
    Ok(UserQuery {
        page: query.page(),
        search: query.get(&["search", "q"]).map(str::to_string),
        rank: parse_filter::<Rank>(query, &["rank"])?,
        is_active: query.get(&["active", "isActive"]).map(parse_bool).transpose()?,
    })
}

/// Build the withdrawal listing filter from the query string
pub fn withdrawal_query(query: &QueryParams) -> Result<WithdrawalQuery> {
    Ok(WithdrawalQuery {
        page: query.page(),
        user_id: query.get(&["userId", "user_id"]).map(str::to_string),
        status: parse_filter(query, &["status"])?,
    })
}

async fn stats(state: &AppState) -> Result<AdminStats> {
    let ledger = state.ledger.stats().await?;
    let rank_pools = state
        .ledger
        .rank_pools()
        .await?
        .iter()
        .map(RankPoolView::from)
        .collect();
    Ok(AdminStats { ledger, rank_pools })
}

pub async fn handle_admin_request(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    if subpath == "/stats" {
        if req.method() != Method::GET {
            return method_not_allowed();
        }
        return respond(StatusCode::OK, stats(&state).await);
    }
    if let Some(rest) = subpath.strip_prefix("/users") {
        return handle_users(req, rest, state, session).await;
    }
    if let Some(rest) = subpath.strip_prefix("/withdrawals") {
        return handle_withdrawals(req, rest, state, session).await;
    }
    if subpath == "/payouts" {
        if req.method() != Method::GET {
            return method_not_allowed();
        }
        let query = QueryParams::from_query_string(req.uri().query());
        return respond(
            StatusCode::OK,
            state
                .ledger
                .payout_queue(query.page())
                .await
                .map(|page| page.map(|entry| PayoutView::from(&entry))),
        );
    }
    if let Some(name) = subpath.strip_prefix("/jobs/") {
        if req.method() != Method::POST {
            return method_not_allowed();
        }
        let job = match name.parse::<Job>() {
            Ok(job) => job,
            Err(_) => return not_found_response(&format!("/admin{subpath}")),
        };
        info!(job = %job, admin = %session.user.identifier, "Job triggered by admin");
        return respond(StatusCode::OK, state.jobs.run_detached(job, DateTime::now()).await);
    }
    not_found_response(&format!("/admin{subpath}"))
}

async fn handle_users(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    let method = req.method().clone();

    if subpath.is_empty() || subpath == "/" {
        if method != Method::GET {
            return method_not_allowed();
        }
        let query = QueryParams::from_query_string(req.uri().query());
        let filter = match user_query(&query) {
            Ok(f) => f,
            Err(e) => return error_from(e),
        };
        return respond(
            StatusCode::OK,
            state
                .ledger
                .list_users(&filter)
                .await
                .map(|page| page.map(|u| UserView::from(&u))),
        );
    }

    if let Some(id) = path_id(subpath, Some("status")) {
        if method != Method::PUT {
            return method_not_allowed();
        }
        let request: UpdateStatusRequest = match parse_json_body(req).await {
            Ok(r) => r,
            Err(e) => return error_from(e),
        };
        if id == session.user.id && !request.is_active {
            return error_from(UplineError::BadRequest(
                "Cannot block your own account".into(),
            ));
        }
        let result = state.wallet.set_active(id, request.is_active).await;
        if result.is_ok() {
            info!(
                user_id = id,
                is_active = request.is_active,
                admin = %session.user.identifier,
                "Member status changed"
            );
        }
        return respond(StatusCode::OK, result.map(|u| UserView::from(&u)));
    }

    if let Some(id) = path_id(subpath, Some("topup")) {
        if method != Method::POST {
            return method_not_allowed();
        }
        let request: TopupRequest = match parse_json_body(req).await {
            Ok(r) => r,
            Err(e) => return error_from(e),
        };
        return respond(
            StatusCode::CREATED,
            state
                .wallet
                .topup(&session.user.id, id, request.amount, request.note, DateTime::now())
                .await
                .map(|tx| TransactionView::from(&tx)),
        );
    }

    if let Some(id) = path_id(subpath, Some("force-logout")) {
        if method != Method::POST {
            return method_not_allowed();
        }
        let result = state.wallet.force_logout(id).await;
        if result.is_ok() {
            info!(user_id = id, admin = %session.user.identifier, "Member tokens revoked");
        }
        return respond(StatusCode::OK, result.map(|u| UserView::from(&u)));
    }

    if let Some(id) = path_id(subpath, None) {
        if method != Method::GET {
            return method_not_allowed();
        }
        return respond(
            StatusCode::OK,
            state.wallet.user(id).await.map(|u| UserView::from(&u)),
        );
    }

    not_found_response(&format!("/admin/users{subpath}"))
}

async fn handle_withdrawals(
    req: Request<Incoming>,
    subpath: &str,
    state: Arc<AppState>,
    session: Session,
) -> Response<FullBody> {
    let method = req.method().clone();

    if subpath.is_empty() || subpath == "/" {
        if method != Method::GET {
            return method_not_allowed();
        }
        let query = QueryParams::from_query_string(req.uri().query());
        let filter = match withdrawal_query(&query) {
            Ok(f) => f,
            Err(e) => return error_from(e),
        };
        return respond(
            StatusCode::OK,
            state
                .withdrawals
                .list(&filter)
                .await
                .map(|page| page.map(|w| WithdrawalView::from(&w))),
        );
    }

    if let Some(id) = path_id(subpath, Some("approve")) {
        if method != Method::POST {
            return method_not_allowed();
        }
        info!(withdrawal_id = id, admin = %session.user.identifier, "Approving withdrawal");
        return respond(
            StatusCode::OK,
            state
                .withdrawals
                .approve(id, DateTime::now())
                .await
                .map(|w| WithdrawalView::from(&w)),
        );
    }

    if let Some(id) = path_id(subpath, Some("reject")) {
        if method != Method::POST {
            return method_not_allowed();
        }
        let request: RejectRequest = match parse_json_body(req).await {
            Ok(r) => r,
            Err(e) => return error_from(e),
        };
        info!(withdrawal_id = id, admin = %session.user.identifier, "Rejecting withdrawal");
        return respond(
            StatusCode::OK,
            state
                .withdrawals
                .reject(id, &request.reason, DateTime::now())
                .await
                .map(|w| WithdrawalView::from(&w)),
        );
    }

    not_found_response(&format!("/admin/withdrawals{subpath}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::WithdrawalStatus;

    #[test]
    fn test_user_query_filters() {
        let query = QueryParams::from_query_string(Some("search=ana&rank=diamond&active=false&limit=5"));
        let filter = user_query(&query).unwrap();
        assert_eq!(filter.search.as_deref(), Some("ana"));
        assert_eq!(filter.rank, Some(Rank::Diamond));
        assert_eq!(filter.is_active, Some(false));
        assert_eq!(filter.page.limit, 5);
    }

    #[test]
    fn test_bad_filters_are_rejected() {
        let query = QueryParams::from_query_string(Some("rank=ruby"));
        assert!(matches!(user_query(&query), Err(UplineError::BadRequest(_))));

        let query = QueryParams::from_query_string(Some("active=maybe"));
        assert!(user_query(&query).is_err());

        let query = QueryParams::from_query_string(Some("status=lost"));
        assert!(withdrawal_query(&query).is_err());
    }

    #[test]
    fn test_withdrawal_query() {
        let query = QueryParams::from_query_string(Some("status=pending&userId=u1"));
        let filter = withdrawal_query(&query).unwrap();
        assert_eq!(filter.status, Some(WithdrawalStatus::Pending));
        assert_eq!(filter.user_id.as_deref(), Some("u1"));
    }
}
