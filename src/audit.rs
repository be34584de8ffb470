//! Conservation Audit
//!
//! After-the-fact proof that money was neither created nor destroyed:
//!
//! 1. every journaled transfer nets to zero, debiting the sender and crediting
//!    the receiver by exactly the recorded amount
//! 2. every COMPLETED record has a journaled mutation, and every journaled
//!    transfer has a record that is not FAILED
//! 3. the sum of all balances equals the net of external deposits and withdrawals
//!
//! A journaled transfer whose record is still PENDING is counted separately:
//! the money moved but the record is waiting for recovery.

use std::collections::HashMap;

use serde::Serialize;

use crate::account::{Account, AppliedMutation, MutationId, MutationKind};
use crate::core_types::{AccountId, TransferId};
use crate::transfer::{TransferRecord, TransferStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Transfer postings do not sum to zero
    UnbalancedMutation { mutation_id: MutationId, net: i128 },
    /// Postings disagree with the record's sender, receiver or amount
    PostingMismatch { transfer_id: TransferId },
    /// Journaled transfer with no ledger record
    MissingRecord { mutation_id: MutationId },
    /// Journaled transfer whose record says FAILED
    AppliedButFailed { transfer_id: TransferId },
    /// COMPLETED record with no journaled mutation
    MissingMutation { transfer_id: TransferId },
    /// Sum of balances differs from net external adjustments
    TotalMismatch { total_balance: i128, net_external: i128 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConservationReport {
    pub accounts: usize,
    pub total_balance: i128,
    pub net_external: i128,
    pub transfers_checked: usize,
    pub awaiting_recovery: usize,
    pub violations: Vec<Violation>,
}

impl ConservationReport {
    pub fn is_conserved(&self) -> bool {
        self.violations.is_empty()
    }
}

pub fn verify_conservation(
    accounts: &[Account],
    mutations: &[AppliedMutation],
    transfers: &[TransferRecord],
) -> ConservationReport {
    let mut report = ConservationReport {
        accounts: accounts.len(),
        total_balance: accounts.iter().map(|a| i128::from(*a.balance)).sum(),
        ..Default::default()
    };

    let records: HashMap<&str, &TransferRecord> = transfers
        .iter()
        .map(|r| (r.transfer_id.as_str(), r))
        .collect();
    let mut journaled: HashMap<&str, &AppliedMutation> = HashMap::new();

    for mutation in mutations {
        match mutation.kind {
            MutationKind::Deposit | MutationKind::Withdrawal => {
                report.net_external += mutation.net();
            }
            MutationKind::Transfer => {
                report.transfers_checked += 1;
                journaled.insert(mutation.mutation_id.as_str(), mutation);
                check_transfer(mutation, records.get(mutation.mutation_id.as_str()), &mut report);
            }
            // Fences move no money
            MutationKind::Void => {}
        }
    }

    for record in transfers {
        if record.status == TransferStatus::Completed
            && !journaled.contains_key(record.transfer_id.as_str())
        {
            report.violations.push(Violation::MissingMutation {
                transfer_id: record.transfer_id.clone(),
            });
        }
    }

    if report.total_balance != report.net_external {
        report.violations.push(Violation::TotalMismatch {
            total_balance: report.total_balance,
            net_external: report.net_external,
        });
    }

    report
}

fn check_transfer(
    mutation: &AppliedMutation,
    record: Option<&&TransferRecord>,
    report: &mut ConservationReport,
) {
    let net = mutation.net();
    if net != 0 {
        report.violations.push(Violation::UnbalancedMutation {
            mutation_id: mutation.mutation_id.clone(),
            net,
        });
    }

    let Some(record) = record else {
        report.violations.push(Violation::MissingRecord {
            mutation_id: mutation.mutation_id.clone(),
        });
        return;
    };

    match record.status {
        TransferStatus::Failed => report.violations.push(Violation::AppliedButFailed {
            transfer_id: record.transfer_id.clone(),
        }),
        TransferStatus::Pending => report.awaiting_recovery += 1,
        TransferStatus::Completed => {}
    }

    let amount = i128::from(*record.amount);
    let delta_of = |account: AccountId| {
        mutation
            .postings
            .iter()
            .find(|p| p.account_id == account)
            .map(|p| p.delta)
    };
    let matches = mutation.postings.len() == 2
        && delta_of(record.sender) == Some(-amount)
        && delta_of(record.receiver) == Some(amount);
    if !matches {
        report.violations.push(Violation::PostingMismatch {
            transfer_id: record.transfer_id.clone(),
        });
    }
}
