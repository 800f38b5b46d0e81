//! Property tests for the credit ledger invariant.
//!
//! The balance must equal the sum of entry deltas after every single
//! mutation, under any interleaving of grants, adjustments, reservations,
//! and settlements.

use proptest::prelude::*;

use steward_core::{LedgerEntryId, PartnerId};
use steward_provision::ledger::{LedgerReason, Partner};

#[derive(Debug, Clone)]
enum Op {
    Grant(i64),
    Adjust(i64),
    Reserve(i64),
    CommitOldest,
    CancelOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1_i64..=50).prop_map(Op::Grant),
        (-20_i64..=20).prop_map(Op::Adjust),
        (1_i64..=10).prop_map(Op::Reserve),
        Just(Op::CommitOldest),
        Just(Op::CancelOldest),
    ]
}

fn oldest_open_reservation(partner: &Partner) -> Option<LedgerEntryId> {
    partner
        .entries
        .iter()
        .find(|e| e.reason == LedgerReason::Reserve)
        .map(|e| e.id)
}

proptest! {
    #[test]
    fn balance_always_equals_ledger_sum(
        start in 0_i64..=100,
        ops in proptest::collection::vec(op_strategy(), 1..60),
    ) {
        let mut partner = Partner::new(PartnerId::generate(), "Acme Hosting", start, 1);
        prop_assert!(partner.is_consistent());

        for op in ops {
            match op {
                Op::Grant(amount) => {
                    partner.apply_grant(amount, None, None);
                }
                Op::Adjust(delta) => {
                    partner.apply_adjust(delta, None, None);
                }
                Op::Reserve(amount) => {
                    // The manager only reserves within the balance.
                    if partner.balance >= amount {
                        partner.apply_reserve(amount, "shop.example.com", "member-1");
                    }
                }
                Op::CommitOldest => {
                    if let Some(id) = oldest_open_reservation(&partner) {
                        prop_assert!(partner.settle_commit(id, "job-ref"));
                    }
                }
                Op::CancelOldest => {
                    if let Some(id) = oldest_open_reservation(&partner) {
                        prop_assert!(partner.settle_cancel(id, None));
                    }
                }
            }
            prop_assert!(
                partner.is_consistent(),
                "balance {} != ledger sum {}",
                partner.balance,
                partner.ledger_sum()
            );
        }
    }

    #[test]
    fn settlement_is_at_most_once(
        start in 1_i64..=50,
        commit_first in any::<bool>(),
    ) {
        let mut partner = Partner::new(PartnerId::generate(), "Acme Hosting", start, 1);
        let id = partner.apply_reserve(1, "shop.example.com", "member-1");

        let (first, second) = if commit_first {
            (partner.settle_commit(id, "job-ref"), partner.settle_cancel(id, None))
        } else {
            (partner.settle_cancel(id, None), partner.settle_commit(id, "job-ref"))
        };
        prop_assert!(first);
        prop_assert!(!second);
        prop_assert!(partner.is_consistent());

        let expected = if commit_first { start - 1 } else { start };
        prop_assert_eq!(partner.balance, expected);
    }
}
