//! Staking session status

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakingState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Snapshot of one staking session; counters reset on every start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StakingStatus {
    pub state: StakingState,
    pub started_utc: Option<i64>,
    pub stopped_utc: Option<i64>,
    pub last_slot_time: Option<u32>,
    pub slots_evaluated: u64,
    /// Coins checked in the most recent slot
    pub coins_evaluated: u64,
    pub kernels_found: u64,
    pub blocks_accepted: u64,
    pub blocks_not_accepted: u64,
    pub out_competed: u64,
    pub exceptions: u64,
    pub network_weight: f64,
    pub own_weight: u64,
    pub expected_time_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_block_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StakingStatus {
    pub fn started(now: i64) -> Self {
        Self {
            state: StakingState::Running,
            started_utc: Some(now),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == StakingState::Running
    }
}
