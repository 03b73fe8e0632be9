//! Permission levels and the route permission table

use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission levels, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum PermissionLevel {
    /// No token
    #[default]
    Public = 0,
    /// Signed-up member
    Member = 1,
    /// Platform operator
    Admin = 2,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionLevel::Public => write!(f, "PUBLIC"),
            PermissionLevel::Member => write!(f, "MEMBER"),
            PermissionLevel::Admin => write!(f, "ADMIN"),
        }
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUBLIC" => Ok(PermissionLevel::Public),
            "MEMBER" => Ok(PermissionLevel::Member),
            "ADMIN" => Ok(PermissionLevel::Admin),
            other => Err(format!("unknown permission level: {other}")),
        }
    }
}

/// Permission a request path needs. Unknown paths fall through to the
/// router's 404, so they are reported as public here.
pub fn required_permission(path: &str) -> PermissionLevel {
    let path = path.split('?').next().unwrap_or(path);

    if path.starts_with("/admin") {
        return PermissionLevel::Admin;
    }

    match path {
        "/health" | "/healthz" | "/version" | "/auth/signup" | "/auth/login" | "/plan" => {
            PermissionLevel::Public
        }
        p if p.starts_with("/auth/")
            || p.starts_with("/account")
            || p.starts_with("/team")
            || p.starts_with("/withdrawals") =>
        {
            PermissionLevel::Member
        }
        _ => PermissionLevel::Public,
    }
}
