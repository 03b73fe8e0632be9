//! HTTP routes for Upline

pub mod account;
pub mod admin;
pub mod auth_routes;
pub mod common;
pub mod health;
pub mod team;
pub mod views;
pub mod withdrawals;

pub use account::handle_account_request;
pub use admin::handle_admin_request;
pub use auth_routes::{handle_auth_request, handle_login, handle_signup, issue_token};
pub use common::{
    error_from, error_response, get_auth_header, json_response, method_not_allowed,
    not_found_response, preflight_response, FullBody, QueryParams,
};
pub use health::{health_check, plan_info, version_info};
pub use team::handle_team_request;
pub use withdrawals::handle_withdrawal_request;
