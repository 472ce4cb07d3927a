use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{LedgerError, Lot, LotAllocation, LotId, LotState, UserId};

/// Allocation of one redemption across lots, computed before any write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionPlan {
    pub allocations: Vec<LotAllocation>,
}

impl RedemptionPlan {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.allocations.iter().map(|item| item.taken).sum()
    }

    #[must_use]
    pub fn lot_ids(&self) -> Vec<LotId> {
        self.allocations.iter().map(|item| item.lot_id).collect()
    }
}

/// Walks redeemable lots soonest-to-expire first (ties by lot id) and
/// allocates `amount` across them. Lots that are not redeemable at `now` are
/// ignored regardless of the order they are passed in.
///
/// # Errors
/// Returns [`LedgerError::InvalidAmount`] for non-positive amounts and
/// [`LedgerError::InsufficientPoints`] when the eligible lots cannot cover
/// `amount`; in both cases no allocation is produced.
pub fn plan_redemption(
    lots: &[Lot],
    amount: i64,
    now: OffsetDateTime,
) -> Result<RedemptionPlan, LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "redeem amount MUST be > 0, got {amount}"
        )));
    }

    let mut eligible: Vec<&Lot> = lots.iter().filter(|lot| lot.is_redeemable_at(now)).collect();
    eligible.sort_by(|lhs, rhs| {
        lhs.valid_until
            .cmp(&rhs.valid_until)
            .then(lhs.lot_id.cmp(&rhs.lot_id))
    });

    let mut remaining_to_redeem = amount;
    let mut allocations = Vec::new();

    for lot in &eligible {
        if remaining_to_redeem == 0 {
            break;
        }

        if lot.remaining_amount <= remaining_to_redeem {
            remaining_to_redeem -= lot.remaining_amount;
            allocations.push(LotAllocation {
                lot_id: lot.lot_id,
                taken: lot.remaining_amount,
                remaining_after: 0,
                state_after: LotState::Consumed,
            });
        } else {
            allocations.push(LotAllocation {
                lot_id: lot.lot_id,
                taken: remaining_to_redeem,
                remaining_after: lot.remaining_amount - remaining_to_redeem,
                state_after: LotState::Active,
            });
            remaining_to_redeem = 0;
        }
    }

    if remaining_to_redeem > 0 {
        return Err(LedgerError::InsufficientPoints {
            requested: amount,
            available: eligible.iter().map(|lot| lot.remaining_amount).sum(),
        });
    }

    Ok(RedemptionPlan { allocations })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerIssue {
    pub code: String,
    pub severity: IssueSeverity,
    pub user_id: Option<UserId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub users_checked: usize,
    pub issues: Vec<LedgerIssue>,
}

impl LedgerCheck {
    #[must_use]
    pub fn from_issues(users_checked: usize, issues: Vec<LedgerIssue>) -> Self {
        let healthy = !issues
            .iter()
            .any(|item| item.severity == IssueSeverity::Error);
        Self {
            contract_version: "ledger_check.v1".to_string(),
            healthy,
            users_checked,
            issues,
        }
    }
}

/// Audits one user's cached balance against their lots.
#[must_use]
pub fn check_user_ledger(
    user_id: UserId,
    balance: i64,
    lots: &[Lot],
    now: OffsetDateTime,
) -> Vec<LedgerIssue> {
    let mut issues = Vec::new();

    if balance < 0 {
        issues.push(LedgerIssue {
            code: "negative_balance".to_string(),
            severity: IssueSeverity::Error,
            user_id: Some(user_id),
            message: format!("balance is negative: {balance}"),
        });
    }

    let active_total: i64 = lots
        .iter()
        .filter(|lot| lot.state == LotState::Active)
        .map(|lot| lot.remaining_amount)
        .sum();
    if active_total != balance {
        issues.push(LedgerIssue {
            code: "balance_mismatch".to_string(),
            severity: IssueSeverity::Error,
            user_id: Some(user_id),
            message: format!("balance={balance} active_lot_total={active_total}"),
        });
    }

    for lot in lots {
        if lot.user_id != user_id {
            issues.push(LedgerIssue {
                code: "foreign_lot".to_string(),
                severity: IssueSeverity::Error,
                user_id: Some(user_id),
                message: format!("lot {} belongs to user {}", lot.lot_id, lot.user_id),
            });
        }

        if let Err(err) = lot.validate() {
            issues.push(LedgerIssue {
                code: "lot_invariant".to_string(),
                severity: IssueSeverity::Error,
                user_id: Some(user_id),
                message: err.to_string(),
            });
        }
    }

    let pending: Vec<&Lot> = lots.iter().filter(|lot| lot.is_due_at(now)).collect();
    if !pending.is_empty() {
        issues.push(LedgerIssue {
            code: "expiry_pending".to_string(),
            severity: IssueSeverity::Warning,
            user_id: Some(user_id),
            message: format!(
                "{} lots past valid_until awaiting expiry ({} points)",
                pending.len(),
                pending.iter().map(|lot| lot.remaining_amount).sum::<i64>()
            ),
        });
    }

    issues
}
