//! Transition rules for every stateful entity.
//!
//! Services check a transition here before issuing the conditional update that
//! persists it, so an illegal move fails with [`TransitionError`] instead of being
//! written. The conditional update then settles races between two legal movers.

use thiserror::Error;

use crate::db::entities::firewall_rule;
use crate::db::enums::{JobStatus, MonitorStatus, ServerStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl TransitionError {
    fn new(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl ServerStatus {
    pub fn can_transition_to(self, next: ServerStatus) -> bool {
        use ServerStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Pending, Active)
                | (Provisioning, Active)
                | (Provisioning, Failed)
                | (Failed, Provisioning)
                | (Active, Offline)
                | (Offline, Active)
                | (Active, Provisioning)
        )
    }

    pub fn transition_to(self, next: ServerStatus) -> Result<ServerStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::new("server", self, next))
        }
    }
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn transition_to(self, next: JobStatus) -> Result<JobStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::new("job", self, next))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Statuses an agent may still pick up and start.
    pub fn claimable() -> [JobStatus; 2] {
        [JobStatus::Pending, JobStatus::Queued]
    }

    /// Statuses that still represent outstanding work on the server.
    pub fn in_flight() -> [JobStatus; 3] {
        [JobStatus::Pending, JobStatus::Queued, JobStatus::Running]
    }
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, InProgress)
                | (Pending, Skipped)
                | (Queued, InProgress)
                | (Queued, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, Pending)
        )
    }

    pub fn transition_to(self, next: StepStatus) -> Result<StepStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::new("provisioning step", self, next))
        }
    }

    /// Completed and skipped steps count towards a finished provisioning run.
    pub fn is_done(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// What a monitor's counters and status look like between probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorCounters {
    pub status: MonitorStatus,
    pub consecutive_failures: i32,
    pub consecutive_successes: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTransition {
    /// pending -> up on the very first success. Not a recovery.
    FirstUp,
    /// Entered down. Fires once per outage.
    WentDown,
    /// down -> up after enough consecutive successes.
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEffect {
    pub counters: MonitorCounters,
    pub transition: Option<MonitorTransition>,
}

impl MonitorCounters {
    /// Applies one probe result with failure/recovery hysteresis.
    ///
    /// A success zeroes the failure streak and a failure zeroes the success streak,
    /// so only uninterrupted runs reach a threshold. Paused monitors are left as-is.
    pub fn after_probe(self, success: bool, failure_threshold: i32, recovery_threshold: i32) -> ProbeEffect {
        if self.status == MonitorStatus::Paused {
            return ProbeEffect {
                counters: self,
                transition: None,
            };
        }

        let failure_threshold = failure_threshold.max(1);
        let recovery_threshold = recovery_threshold.max(1);
        let mut next = self;
        let mut transition = None;

        if success {
            next.consecutive_failures = 0;
            next.consecutive_successes = self.consecutive_successes.saturating_add(1);
            match self.status {
                MonitorStatus::Pending => {
                    next.status = MonitorStatus::Up;
                    transition = Some(MonitorTransition::FirstUp);
                }
                MonitorStatus::Down if next.consecutive_successes >= recovery_threshold => {
                    next.status = MonitorStatus::Up;
                    transition = Some(MonitorTransition::Recovered);
                }
                _ => {}
            }
        } else {
            next.consecutive_successes = 0;
            next.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.status != MonitorStatus::Down && next.consecutive_failures >= failure_threshold {
                next.status = MonitorStatus::Down;
                transition = Some(MonitorTransition::WentDown);
            }
        }

        ProbeEffect {
            counters: next,
            transition,
        }
    }
}

/// The safety-relevant state of a firewall rule, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallState {
    Inactive,
    Active,
    PendingConfirmation,
    RolledBack,
}

impl FirewallState {
    pub fn of(rule: &firewall_rule::Model) -> Self {
        if rule.is_pending_confirmation {
            FirewallState::PendingConfirmation
        } else if rule.is_active {
            FirewallState::Active
        } else if rule.rolled_back_at.is_some() {
            FirewallState::RolledBack
        } else {
            FirewallState::Inactive
        }
    }

    pub fn can_confirm(self) -> bool {
        self == FirewallState::PendingConfirmation
    }

    pub fn can_revert(self) -> bool {
        matches!(self, FirewallState::Active | FirewallState::PendingConfirmation)
    }

    pub fn can_apply(self) -> bool {
        matches!(self, FirewallState::Inactive | FirewallState::RolledBack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> MonitorCounters {
        MonitorCounters {
            status: MonitorStatus::Pending,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    fn run(start: MonitorCounters, probes: &[bool], failure: i32, recovery: i32) -> Vec<ProbeEffect> {
        let mut current = start;
        probes
            .iter()
            .map(|ok| {
                let effect = current.after_probe(*ok, failure, recovery);
                current = effect.counters;
                effect
            })
            .collect()
    }

    #[test]
    fn three_failures_then_two_successes_flip_exactly_on_threshold() {
        let up = MonitorCounters {
            status: MonitorStatus::Up,
            ..pending()
        };
        let effects = run(up, &[false, false, false, true, true], 3, 2);

        assert_eq!(effects[0].counters.status, MonitorStatus::Up);
        assert_eq!(effects[1].counters.status, MonitorStatus::Up);
        assert_eq!(effects[2].counters.status, MonitorStatus::Down);
        assert_eq!(effects[2].transition, Some(MonitorTransition::WentDown));
        assert_eq!(effects[3].counters.status, MonitorStatus::Down);
        assert_eq!(effects[3].transition, None);
        assert_eq!(effects[4].counters.status, MonitorStatus::Up);
        assert_eq!(effects[4].transition, Some(MonitorTransition::Recovered));
    }

    #[test]
    fn interleaved_success_resets_failure_streak() {
        let up = MonitorCounters {
            status: MonitorStatus::Up,
            ..pending()
        };
        let effects = run(up, &[false, false, true, false, false], 3, 2);

        assert!(effects.iter().all(|e| e.counters.status == MonitorStatus::Up));
        assert!(effects.iter().all(|e| e.transition.is_none()));
        assert_eq!(effects[2].counters.consecutive_failures, 0);
        assert_eq!(effects[4].counters.consecutive_failures, 2);
    }

    #[test]
    fn interleaved_failure_resets_recovery_streak() {
        let down = MonitorCounters {
            status: MonitorStatus::Down,
            consecutive_failures: 5,
            consecutive_successes: 0,
        };
        let effects = run(down, &[true, false, true], 3, 2);
        assert!(effects.iter().all(|e| e.counters.status == MonitorStatus::Down));
        assert_eq!(effects[2].counters.consecutive_successes, 1);
    }

    #[test]
    fn pending_goes_up_on_first_success() {
        let effect = pending().after_probe(true, 3, 5);
        assert_eq!(effect.counters.status, MonitorStatus::Up);
        assert_eq!(effect.transition, Some(MonitorTransition::FirstUp));
    }

    #[test]
    fn pending_goes_down_only_at_failure_threshold() {
        let effects = run(pending(), &[false, false], 2, 2);
        assert_eq!(effects[0].counters.status, MonitorStatus::Pending);
        assert_eq!(effects[0].counters.consecutive_failures, 1);
        assert_eq!(effects[1].counters.status, MonitorStatus::Down);
        assert_eq!(effects[1].transition, Some(MonitorTransition::WentDown));
    }

    #[test]
    fn down_notification_fires_once_per_outage() {
        let effects = run(pending(), &[false, false, false, false], 2, 2);
        let downs = effects
            .iter()
            .filter(|e| e.transition == Some(MonitorTransition::WentDown))
            .count();
        assert_eq!(downs, 1);
    }

    #[test]
    fn paused_monitor_ignores_results() {
        let paused = MonitorCounters {
            status: MonitorStatus::Paused,
            ..pending()
        };
        let effect = paused.after_probe(false, 1, 1);
        assert_eq!(effect.counters, paused);
        assert_eq!(effect.transition, None);
    }

    #[test]
    fn job_transitions_only_move_forward_except_retry() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));

        let err = JobStatus::Completed.transition_to(JobStatus::Failed).unwrap_err();
        assert_eq!(err.to_string(), "invalid job transition: completed -> failed");
    }

    #[test]
    fn server_cannot_jump_from_pending_to_offline() {
        assert!(ServerStatus::Pending.transition_to(ServerStatus::Offline).is_err());
        assert!(ServerStatus::Offline.can_transition_to(ServerStatus::Active));
    }

    #[test]
    fn failed_step_is_retryable() {
        assert!(StepStatus::Failed.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Completed.can_transition_to(StepStatus::Pending));
        assert!(StepStatus::Skipped.is_done());
        assert!(!StepStatus::Failed.is_done());
    }
}
