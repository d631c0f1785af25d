//! Fee transaction state machine.
//!
//! ```text
//! PENDING ──ledger ok──▶ COLLECTED ──refund──▶ REFUNDED
//!    │  ▲                    ▲
//!  fail retry (retry_count < max)
//!    ▼  │                    │
//!  FAILED ──found on ledger──┘
//! ```
//!
//! The FAILED → COLLECTED edge is not a regular transition: it only corrects a
//! record whose last submission ended without a definite answer and whose
//! payment later turns up on the ledger (see [`FeeTransaction::reconcile_landed`]).
//!
//! Every transition is a method on [`FeeTransaction`] that mutates the in-memory
//! record and keeps the field invariants: `collected_at` is set only while
//! COLLECTED, `failure_reason` only while FAILED, and `retry_count` never
//! decreases. Persisting the result (and detecting lost races) is the caller's job.

use chrono::{DateTime, Utc};

use super::error::SettlementError;
use super::policy::RetryPolicy;
use super::types::{FeeStatus, FeeTransaction};

impl FeeStatus {
    /// Edges of the state machine; everything else is an invalid transition
    #[must_use]
    pub fn can_transition_to(self, to: FeeStatus) -> bool {
        matches!(
            (self, to),
            (FeeStatus::Pending, FeeStatus::Collected)
                | (FeeStatus::Pending, FeeStatus::Failed)
                | (FeeStatus::Failed, FeeStatus::Pending)
                | (FeeStatus::Collected, FeeStatus::Refunded)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, FeeStatus::Collected | FeeStatus::Refunded)
    }
}

/// What a recorded ledger failure means for further processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retryable failure with a slot left; retry due at the given time
    RetryScheduled(DateTime<Utc>),
    /// Retryable failure that used the last slot
    Exhausted,
    /// Permanent rejection; no slot consumed, no retry scheduled
    NotRetryable,
}

/// Result of a refund request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    AlreadyRefunded,
}

fn ensure(from: FeeStatus, to: FeeStatus) -> Result<(), SettlementError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(SettlementError::InvalidStateTransition { from, to })
    }
}

impl FeeTransaction {
    /// Record that a submission to the ledger is starting
    pub fn mark_attempted(&mut self, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if self.status != FeeStatus::Pending {
            return Err(SettlementError::InvalidStateTransition {
                from: self.status,
                to: FeeStatus::Pending,
            });
        }
        self.last_attempt_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// PENDING → COLLECTED on ledger confirmation
    pub fn mark_collected(
        &mut self,
        tx_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        ensure(self.status, FeeStatus::Collected)?;
        self.status = FeeStatus::Collected;
        self.ledger_tx_hash = Some(tx_hash.into());
        self.collected_at = Some(now);
        self.failure_reason = None;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// PENDING → COLLECTED without a ledger payment, for a fee that rounds to zero
    pub fn mark_waived(&mut self, now: DateTime<Utc>) -> Result<(), SettlementError> {
        ensure(self.status, FeeStatus::Collected)?;
        self.status = FeeStatus::Collected;
        self.collected_at = Some(now);
        self.failure_reason = None;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// PENDING → FAILED on ledger rejection or timeout.
    ///
    /// Retryable failures consume a retry slot and, while slots remain, schedule
    /// the next attempt with exponential backoff.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, SettlementError> {
        ensure(self.status, FeeStatus::Failed)?;
        self.status = FeeStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.updated_at = now;

        let outcome = if !retryable {
            FailureOutcome::NotRetryable
        } else {
            self.retry_count = self.retry_count.saturating_add(1);
            if policy.allows_retry(self.retry_count) {
                let delay = chrono::Duration::from_std(policy.backoff(self.retry_count))
                    .unwrap_or(chrono::Duration::MAX);
                FailureOutcome::RetryScheduled(
                    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
                )
            } else {
                FailureOutcome::Exhausted
            }
        };

        self.next_retry_at = match outcome {
            FailureOutcome::RetryScheduled(at) => Some(at),
            _ => None,
        };
        Ok(outcome)
    }

    /// FAILED → PENDING, only while `retry_count` is below the configured maximum
    pub fn begin_retry(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        ensure(self.status, FeeStatus::Pending)?;
        if !policy.allows_retry(self.retry_count) {
            return Err(SettlementError::RetryExhausted {
                id: self.id.clone(),
                retry_count: self.retry_count,
                max_retries: policy.max_retries,
            });
        }
        self.status = FeeStatus::Pending;
        self.failure_reason = None;
        self.next_retry_at = None;
        // The previous attempt is over; the next one claims afresh
        self.last_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Drop the automatic retry of a FAILED transaction. Returns false if none was due.
    pub fn clear_scheduled_retry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != FeeStatus::Failed || self.next_retry_at.is_none() {
            return false;
        }
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }

    /// Whether an earlier attempt ended in a way that may still have reached the ledger
    #[must_use]
    pub fn may_have_landed(&self) -> bool {
        self.retry_count > 0
    }

    /// FAILED with nothing scheduled, after a submission whose outcome on the
    /// ledger has not been checked yet
    #[must_use]
    pub fn awaiting_ledger_check(&self) -> bool {
        self.status == FeeStatus::Failed
            && self.next_retry_at.is_none()
            && self.last_attempt_at.is_some()
    }

    /// FAILED → COLLECTED when the ledger shows the payment of an unchecked
    /// submission landed after all
    pub fn reconcile_landed(
        &mut self,
        tx_hash: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        if !self.awaiting_ledger_check() {
            return Err(SettlementError::InvalidStateTransition {
                from: self.status,
                to: FeeStatus::Collected,
            });
        }
        self.status = FeeStatus::Collected;
        self.ledger_tx_hash = Some(tx_hash.into());
        self.collected_at = Some(now);
        self.failure_reason = None;
        self.updated_at = now;
        Ok(())
    }

    /// Record that the ledger holds no payment for the last submission.
    /// Returns false if no check was outstanding.
    pub fn confirm_not_landed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.awaiting_ledger_check() {
            return false;
        }
        self.last_attempt_at = None;
        self.updated_at = now;
        true
    }

    /// COLLECTED → REFUNDED; a no-op on a transaction that is already REFUNDED.
    ///
    /// The fee amount and retry count are kept as the record of what was charged.
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<RefundOutcome, SettlementError> {
        if self.status == FeeStatus::Refunded {
            return Ok(RefundOutcome::AlreadyRefunded);
        }
        ensure(self.status, FeeStatus::Refunded)?;
        self.status = FeeStatus::Refunded;
        self.collected_at = None;
        self.next_retry_at = None;
        self.refunded_at = Some(now);
        self.updated_at = now;
        Ok(RefundOutcome::Refunded)
    }

    /// Whether the record satisfies the per-status field invariants
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.retry_count >= 0
            && self.collected_at.is_some() == (self.status == FeeStatus::Collected)
            && self.failure_reason.is_some() == (self.status == FeeStatus::Failed)
            && (self.status == FeeStatus::Failed || self.next_retry_at.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;
    use crate::domain::types::{Asset, FeeQuote, FeeTier, UserContext, UserTier};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
        }
    }

    fn pending() -> FeeTransaction {
        let quote = FeeQuote {
            trade_amount: "1000".parse().unwrap(),
            fee_rate: "0.001".parse().unwrap(),
            fee_tier: FeeTier::Standard,
            fee_amount: "1".parse().unwrap(),
            promotion: None,
        };
        let user = UserContext::new("user_1", UserTier::Standard, Money::ZERO);
        FeeTransaction::new(&quote, &user, None, Asset::native(), Some("GDEST".into()))
    }

    #[test]
    fn test_transition_table() {
        use FeeStatus::*;
        let all = [Pending, Collected, Failed, Refunded];
        let allowed = [
            (Pending, Collected),
            (Pending, Failed),
            (Failed, Pending),
            (Collected, Refunded),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_collect_sets_hash_and_timestamp() {
        let mut tx = pending();
        let now = Utc::now();
        tx.mark_collected("abc123", now).unwrap();

        assert_eq!(tx.status, FeeStatus::Collected);
        assert_eq!(tx.collected_at, Some(now));
        assert_eq!(tx.ledger_tx_hash.as_deref(), Some("abc123"));
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_retryable_failure_consumes_slot_and_schedules() {
        let mut tx = pending();
        let now = Utc::now();
        let outcome = tx.mark_failed("timeout", true, &policy(3), now).unwrap();

        assert_eq!(
            outcome,
            FailureOutcome::RetryScheduled(now + chrono::Duration::seconds(1))
        );
        assert_eq!(tx.retry_count, 1);
        assert_eq!(tx.failure_reason.as_deref(), Some("timeout"));
        assert_eq!(tx.next_retry_at, Some(now + chrono::Duration::seconds(1)));
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_non_retryable_failure_keeps_retry_count() {
        let mut tx = pending();
        let outcome = tx
            .mark_failed("op_no_destination", false, &policy(3), Utc::now())
            .unwrap();

        assert_eq!(outcome, FailureOutcome::NotRetryable);
        assert_eq!(tx.retry_count, 0);
        assert!(tx.next_retry_at.is_none());
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_retry_cycle_until_exhausted() {
        let mut tx = pending();
        let policy = policy(3);

        for attempt in 1..=3 {
            tx.mark_attempted(Utc::now()).unwrap();
            let outcome = tx.mark_failed("timeout", true, &policy, Utc::now()).unwrap();
            assert_eq!(tx.retry_count, attempt);
            if attempt < 3 {
                assert!(matches!(outcome, FailureOutcome::RetryScheduled(_)));
                tx.begin_retry(&policy, Utc::now()).unwrap();
                assert_eq!(tx.status, FeeStatus::Pending);
                assert!(tx.last_attempt_at.is_none());
                assert!(tx.failure_reason.is_none());
            } else {
                assert_eq!(outcome, FailureOutcome::Exhausted);
            }
        }

        assert_eq!(tx.status, FeeStatus::Failed);
        assert!(tx.next_retry_at.is_none());
        assert_eq!(
            tx.begin_retry(&policy, Utc::now()),
            Err(SettlementError::RetryExhausted {
                id: tx.id.clone(),
                retry_count: 3,
                max_retries: 3,
            })
        );
        assert_eq!(tx.status, FeeStatus::Failed);
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_exhausted_timeout_can_be_reconciled_as_landed() {
        let mut tx = pending();
        let policy = policy(1);
        tx.mark_attempted(Utc::now()).unwrap();
        let outcome = tx.mark_failed("timeout", true, &policy, Utc::now()).unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert!(tx.awaiting_ledger_check());

        tx.reconcile_landed("landed", Utc::now()).unwrap();
        assert_eq!(tx.status, FeeStatus::Collected);
        assert_eq!(tx.ledger_tx_hash.as_deref(), Some("landed"));
        assert_eq!(tx.retry_count, 1);
        assert!(tx.is_consistent());
        assert!(tx.reconcile_landed("again", Utc::now()).is_err());
    }

    #[test]
    fn test_confirmed_absence_ends_ledger_check() {
        let mut tx = pending();
        assert!(!tx.awaiting_ledger_check());

        tx.mark_attempted(Utc::now()).unwrap();
        tx.mark_failed("timeout", true, &policy(1), Utc::now()).unwrap();
        assert!(tx.confirm_not_landed(Utc::now()));
        assert!(!tx.awaiting_ledger_check());
        assert!(!tx.confirm_not_landed(Utc::now()));
        assert_eq!(tx.status, FeeStatus::Failed);
        assert!(tx.reconcile_landed("late", Utc::now()).is_err());
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_scheduled_failure_is_not_awaiting_check() {
        let mut tx = pending();
        tx.mark_attempted(Utc::now()).unwrap();
        tx.mark_failed("timeout", true, &policy(3), Utc::now()).unwrap();
        assert!(tx.next_retry_at.is_some());
        assert!(!tx.awaiting_ledger_check());
        assert!(tx.reconcile_landed("early", Utc::now()).is_err());
    }

    #[test]
    fn test_waived_fee_collects_without_hash() {
        let mut tx = pending();
        tx.mark_waived(Utc::now()).unwrap();
        assert_eq!(tx.status, FeeStatus::Collected);
        assert!(tx.ledger_tx_hash.is_none());
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_clear_scheduled_retry_only_applies_to_due_failures() {
        let mut tx = pending();
        assert!(!tx.clear_scheduled_retry(Utc::now()));

        tx.mark_failed("timeout", true, &policy(3), Utc::now()).unwrap();
        assert!(tx.clear_scheduled_retry(Utc::now()));
        assert!(tx.next_retry_at.is_none());
        assert_eq!(tx.status, FeeStatus::Failed);
        assert!(!tx.clear_scheduled_retry(Utc::now()));

        // A cleared schedule still allows a manual retry
        tx.begin_retry(&policy(3), Utc::now()).unwrap();
        assert_eq!(tx.status, FeeStatus::Pending);
    }

    #[test]
    fn test_refund_is_idempotent() {
        let mut tx = pending();
        tx.mark_collected("abc", Utc::now()).unwrap();

        assert_eq!(tx.refund(Utc::now()).unwrap(), RefundOutcome::Refunded);
        let after_first = tx.clone();
        assert_eq!(
            tx.refund(Utc::now()).unwrap(),
            RefundOutcome::AlreadyRefunded
        );
        assert_eq!(tx, after_first);
        assert!(tx.collected_at.is_none());
        assert!(tx.refunded_at.is_some());
        assert_eq!(tx.fee_amount.to_string(), "1.0000000");
        assert!(tx.is_consistent());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut tx = pending();
        assert_eq!(
            tx.refund(Utc::now()),
            Err(SettlementError::InvalidStateTransition {
                from: FeeStatus::Pending,
                to: FeeStatus::Refunded,
            })
        );
        assert!(tx.begin_retry(&policy(3), Utc::now()).is_err());

        tx.mark_collected("abc", Utc::now()).unwrap();
        assert!(tx.mark_failed("late", true, &policy(3), Utc::now()).is_err());
        assert!(tx.mark_collected("again", Utc::now()).is_err());
        assert!(tx.mark_attempted(Utc::now()).is_err());
        assert_eq!(tx.ledger_tx_hash.as_deref(), Some("abc"));
    }
}
