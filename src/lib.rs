pub mod alerts;
pub mod app;
pub mod captcha;
pub mod config;
pub mod error;
pub mod login;
pub mod mailbox;
pub mod mfa;
pub mod notify;
pub mod portal;
pub mod recipients;
pub mod session;
pub mod shutdown;
pub mod util;

use serde::{Deserialize, Serialize};

/// One club row of the union's limit listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Backend id (`cno`), the key for cooldowns and recipient lookup
    pub id: i64,
    /// User-facing club id
    pub public_id: String,
    pub name: String,
    pub owner: String,
    pub ring_pnl: f64,
    pub tournament_pnl: f64,
    /// 0 means "no loss limit configured"
    pub loss_limit: f64,
    /// 0 means "no win limit configured"
    pub win_limit: f64,
}

impl EntitySnapshot {
    pub fn total_pnl(&self) -> f64 {
        self.ring_pnl + self.tournament_pnl
    }
}

/// Weekly limit record of a single club.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDetail {
    pub public_id: String,
    pub name: String,
    pub owner: String,
    pub win_limit: f64,
    pub loss_limit: f64,
    pub include: Option<bool>,
}
