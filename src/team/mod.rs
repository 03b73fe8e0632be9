//! Referral tree traversal
//!
//! Upline walks follow sponsor pointers; downline walks go breadth-first
//! over direct referrals. Both are capped at [`MAX_DEPTH`] levels.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::db::schemas::UserDoc;
use crate::income::Rank;
use crate::ledger::Ledger;
use crate::types::{Result, UplineError};

/// Deepest level any walk reaches
pub const MAX_DEPTH: usize = 6;

/// Requested depth clamped to 1..=MAX_DEPTH, defaulting to the maximum
pub fn clamp_depth(depth: Option<usize>) -> usize {
    depth.unwrap_or(MAX_DEPTH).clamp(1, MAX_DEPTH)
}

/// Sponsors of `user`, nearest first, at most `depth` of them.
/// Stops early at the root or if the sponsor chain loops.
pub async fn walk_upline(ledger: &dyn Ledger, user: &UserDoc, depth: usize) -> Result<Vec<UserDoc>> {
    let mut chain = Vec::with_capacity(depth);
    let mut seen = HashSet::from([user.id.clone()]);
    let mut next = user.sponsor_id.clone();

    while chain.len() < depth {
        let Some(sponsor_id) = next else { break };
        if !seen.insert(sponsor_id.clone()) {
            break;
        }
        let Some(sponsor) = ledger.user(&sponsor_id).await? else {
            break;
        };
        next = sponsor.sponsor_id.clone();
        chain.push(sponsor);
    }

    Ok(chain)
}

/// Downline of `user_id` grouped by level, level 1 first
pub async fn walk_downline(ledger: &dyn Ledger, user_id: &str, depth: usize) -> Result<Vec<Vec<UserDoc>>> {
    let mut levels: Vec<Vec<UserDoc>> = Vec::new();
    let mut seen = HashSet::from([user_id.to_string()]);
    let mut frontier = vec![user_id.to_string()];

    for _ in 0..depth {
        let mut level = Vec::new();
        for parent in &frontier {
            for child in ledger.direct_referrals(parent).await? {
                if seen.insert(child.id.clone()) {
                    level.push(child);
                }
            }
        }
        if level.is_empty() {
            break;
        }
        frontier = level.iter().map(|u| u.id.clone()).collect();
        levels.push(level);
    }

    Ok(levels)
}

/// Public view of a team member
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: String,
    pub display_name: String,
    pub referral_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<Rank>,
    /// Distance from the requesting member
    pub level: u32,
    pub is_active: bool,
    pub direct_referrals: u32,
    pub team_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<String>,
}

impl TeamMember {
    fn from_user(user: &UserDoc, level: u32) -> Self {
        Self {
            id: user.id.clone(),
            display_name: user.display_name.clone(),
            referral_code: user.referral_code.clone(),
            rank: user.rank,
            level,
            is_active: user.is_active,
            direct_referrals: user.direct_referrals,
            team_size: user.team_size,
            joined_at: user
                .metadata
                .created_at
                .and_then(|d| d.try_to_rfc3339_string().ok()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlineLevel {
    pub level: u32,
    pub count: usize,
    /// Members at this level holding any rank
    pub activated: usize,
    pub members: Vec<TeamMember>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Downline {
    pub depth: usize,
    pub total: usize,
    pub levels: Vec<DownlineLevel>,
}

/// Read-only team queries for the member dashboard
#[derive(Clone)]
pub struct TeamService {
    ledger: Arc<dyn Ledger>,
}

impl TeamService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    async fn load(&self, user_id: &str) -> Result<UserDoc> {
        self.ledger
            .user(user_id)
            .await?
            .ok_or_else(|| UplineError::NotFound(format!("User {user_id} not found")))
    }

    pub async fn upline(&self, user_id: &str, depth: Option<usize>) -> Result<Vec<TeamMember>> {
        let user = self.load(user_id).await?;
        let chain = walk_upline(self.ledger.as_ref(), &user, clamp_depth(depth)).await?;
        Ok(chain
            .iter()
            .enumerate()
            .map(|(i, sponsor)| TeamMember::from_user(sponsor, i as u32 + 1))
            .collect())
    }

    pub async fn downline(&self, user_id: &str, depth: Option<usize>) -> Result<Downline> {
        self.load(user_id).await?;
        let depth = clamp_depth(depth);
        let levels = walk_downline(self.ledger.as_ref(), user_id, depth).await?;

        let levels: Vec<DownlineLevel> = levels
            .iter()
            .enumerate()
            .map(|(i, users)| {
                let level = i as u32 + 1;
                DownlineLevel {
                    level,
                    count: users.len(),
                    activated: users.iter().filter(|u| u.rank.is_some()).count(),
                    members: users.iter().map(|u| TeamMember::from_user(u, level)).collect(),
                }
            })
            .collect();

        Ok(Downline {
            depth,
            total: levels.iter().map(|l| l.count).sum(),
            levels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerBatch, LedgerOp, MemoryLedger};

    fn member(n: usize, sponsor: Option<&UserDoc>) -> UserDoc {
        UserDoc::new(
            format!("m{n}@example.com"),
            format!("Member {n}"),
            "hash".into(),
            format!("UP{n:06}"),
            sponsor.map(|s| s.id.clone()),
        )
    }

    /// Straight line m0 <- m1 <- ... <- m(n-1)
    async fn chain(len: usize) -> (Arc<MemoryLedger>, Vec<UserDoc>) {
        let ledger = Arc::new(MemoryLedger::new());
        let mut users: Vec<UserDoc> = Vec::new();
        let mut batch = LedgerBatch::new();
        for n in 0..len {
            let user = member(n, users.last());
            batch.push(LedgerOp::InsertUser(user.clone()));
            users.push(user);
        }
        ledger.commit(batch).await.unwrap();
        (ledger, users)
    }

    #[test]
    fn test_clamp_depth() {
        assert_eq!(clamp_depth(None), 6);
        assert_eq!(clamp_depth(Some(0)), 1);
        assert_eq!(clamp_depth(Some(3)), 3);
        assert_eq!(clamp_depth(Some(50)), 6);
    }

    #[tokio::test]
    async fn test_upline_is_bounded() {
        let (ledger, users) = chain(10).await;
        let team = TeamService::new(ledger);

        let upline = team.upline(&users[9].id, Some(20)).await.unwrap();
        assert_eq!(upline.len(), MAX_DEPTH);
        assert_eq!(upline[0].id, users[8].id);
        assert_eq!(upline[0].level, 1);
        assert_eq!(upline[5].id, users[3].id);

        let short = team.upline(&users[2].id, None).await.unwrap();
        assert_eq!(short.len(), 2);
    }

    #[tokio::test]
    async fn test_downline_groups_by_level() {
        let ledger = Arc::new(MemoryLedger::new());
        let root = member(0, None);
        let a = member(1, Some(&root));
        let b = member(2, Some(&root));
        let a1 = member(3, Some(&a));

        let mut batch = LedgerBatch::new();
        for user in [&root, &a, &b, &a1] {
            batch.push(LedgerOp::InsertUser(user.clone()));
        }
        ledger.commit(batch).await.unwrap();

        let downline = TeamService::new(ledger).downline(&root.id, None).await.unwrap();
        assert_eq!(downline.total, 3);
        assert_eq!(downline.levels.len(), 2);
        assert_eq!(downline.levels[0].count, 2);
        assert_eq!(downline.levels[1].members[0].id, a1.id);
        assert_eq!(downline.levels[1].members[0].level, 2);
    }

    #[tokio::test]
    async fn test_downline_depth_limit() {
        let (ledger, users) = chain(9).await;
        let downline = TeamService::new(ledger.clone())
            .downline(&users[0].id, Some(2))
            .await
            .unwrap();
        assert_eq!(downline.levels.len(), 2);

        let full = walk_downline(ledger.as_ref(), &users[0].id, MAX_DEPTH).await.unwrap();
        assert_eq!(full.len(), MAX_DEPTH);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let ledger = Arc::new(MemoryLedger::new());
        let err = TeamService::new(ledger).upline("missing", None).await.unwrap_err();
        assert!(matches!(err, UplineError::NotFound(_)));
    }
}
