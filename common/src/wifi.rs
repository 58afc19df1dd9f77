use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{Bssid, NetworkSection};

pub const ATTEMPT_INCREMENT: u16 = 60;
pub const MAX_ATTEMPT_BUDGET: u16 = 240;

/// Grows the attempt budget for a scan join, stopping at the cap.
///
/// Budgets already at or above the cap are left as configured.
pub fn widen_attempt_budget(budget: u16) -> u16 {
    if budget >= MAX_ATTEMPT_BUDGET {
        budget
    } else {
        budget
            .saturating_add(ATTEMPT_INCREMENT)
            .min(MAX_ATTEMPT_BUDGET)
    }
}

/// What the radio should be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Scan {
        ssid: String,
        passphrase: String,
    },
    Direct {
        ssid: String,
        passphrase: String,
        bssid: Bssid,
        channel: u8,
    },
}

/// Link state observed by the radio at the end of one attempt slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Connected { bssid: Bssid, channel: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    Joining { remaining: u16 },
    Joined,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPoll {
    /// Wait this long, then poll the link again.
    Retry(Duration),
    Joined,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JoinManager {
    state: JoinState,
    scanning: bool,
    retry_delay: Duration,
    dirty: bool,
}

impl Default for JoinManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinManager {
    pub fn new() -> Self {
        Self {
            state: JoinState::Idle,
            scanning: false,
            retry_delay: Duration::ZERO,
            dirty: false,
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    /// True once the join has changed `network` in a way that must be persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn start(&mut self, network: &mut NetworkSection) -> JoinTarget {
        self.retry_delay = Duration::from_millis(u64::from(network.con_delay_ms));
        self.scanning = network.bssid.is_unknown() || network.channel == 0;

        let target = if self.scanning {
            let widened = widen_attempt_budget(network.max_con_attempts);
            if widened != network.max_con_attempts {
                network.max_con_attempts = widened;
                self.dirty = true;
            }
            info!(
                "joining `{}` by scan, {} attempts of {:?}",
                network.ssid, network.max_con_attempts, self.retry_delay
            );
            JoinTarget::Scan {
                ssid: network.ssid.clone(),
                passphrase: network.passphrase.clone(),
            }
        } else {
            info!(
                "joining `{}` at {} on channel {}",
                network.ssid, network.bssid, network.channel
            );
            JoinTarget::Direct {
                ssid: network.ssid.clone(),
                passphrase: network.passphrase.clone(),
                bssid: network.bssid,
                channel: network.channel,
            }
        };

        self.state = JoinState::Joining {
            remaining: network.max_con_attempts.max(1),
        };
        target
    }

    /// Consumes one attempt slot.
    pub fn poll(&mut self, network: &mut NetworkSection, link: LinkStatus) -> JoinPoll {
        let JoinState::Joining { remaining } = self.state else {
            return match self.state {
                JoinState::Joined => JoinPoll::Joined,
                _ => JoinPoll::Failed,
            };
        };

        if let LinkStatus::Connected { bssid, channel } = link {
            self.learn(network, bssid, channel);
            self.state = JoinState::Joined;
            return JoinPoll::Joined;
        }

        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            warn!("join of `{}` exhausted its attempts", network.ssid);
            if !network.bssid.is_unknown() || network.channel != 0 {
                self.dirty = true;
            }
            network.forget_access_point();
            self.state = JoinState::Failed;
            return JoinPoll::Failed;
        }

        debug!("link down, {remaining} attempts left");
        self.state = JoinState::Joining { remaining };
        JoinPoll::Retry(self.retry_delay)
    }

    fn learn(&mut self, network: &mut NetworkSection, bssid: Bssid, channel: u8) {
        if self.scanning && !bssid.is_unknown() {
            info!("learned access point {bssid}");
            network.bssid = bssid;
            self.dirty = true;
        }

        if channel != network.channel {
            info!("access point channel {} -> {channel}", network.channel);
            network.channel = channel;
            self.dirty = true;
        }
    }
}
