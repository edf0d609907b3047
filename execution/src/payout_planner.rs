//! Prize pool allocation.
//!
//! All arithmetic is on integer smallest-currency units and checked:
//!
//! 1. `house_cut = pool * house_cut_bps / 10_000` (floor)
//! 2. `distributable = pool - house_cut`
//! 3. A `Bps` tier reserves `distributable * bps / 10_000` whether or not it
//!    has winners; a `Fixed` tier reserves its amount only when claimed.
//! 4. A tier's reservation is split evenly between its winners; the split
//!    remainder, unclaimed reservations and unreserved distributable amount
//!    all go to the treasury.
//!
//! Items with a zero amount are omitted. The resulting plan always satisfies
//! `sum(items) + treasury == pool`.

use crate::error::EngineError;
use drawsettle_types::{
    idempotency_key, Match, PayoutItem, PayoutPlan, Round, TicketSnapshot, TierShare,
    BPS_DENOMINATOR,
};
use std::collections::BTreeMap;

fn bps_of(amount: u64, bps: u64) -> Result<u64, EngineError> {
    let value = u128::from(amount) * u128::from(bps) / u128::from(BPS_DENOMINATOR);
    u64::try_from(value)
        .map_err(|_| EngineError::ArithmeticInvariant(format!("{amount} * {bps} bps overflows")))
}

fn add(a: u64, b: u64) -> Result<u64, EngineError> {
    a.checked_add(b)
        .ok_or_else(|| EngineError::ArithmeticInvariant(format!("{a} + {b} overflows")))
}

/// Build the payout plan for `round` from its matches.
///
/// `snapshot` supplies the recipient (ticket owner) for each winner.
pub fn plan(
    round: &Round,
    matches: &[Match],
    snapshot: &TicketSnapshot,
) -> Result<PayoutPlan, EngineError> {
    let config = &round.config;
    let pool = round.prize_pool;
    let house_cut = bps_of(pool, u64::from(config.house_cut_bps))?;
    let distributable = pool.checked_sub(house_cut).ok_or_else(|| {
        EngineError::ArithmeticInvariant(format!("house cut {house_cut} exceeds pool {pool}"))
    })?;

    let mut winners: BTreeMap<u8, Vec<&Match>> = BTreeMap::new();
    for entry in matches {
        if let Some(tier) = entry.tier {
            winners.entry(tier).or_default().push(entry);
        }
    }

    let mut reserved = 0u64;
    let mut treasury = house_cut;
    let mut items = Vec::new();
    for (tier, share) in &config.tiers {
        let tier_winners = winners.remove(tier).unwrap_or_default();
        let amount = match *share {
            TierShare::Bps(bps) => bps_of(distributable, u64::from(bps))?,
            TierShare::Fixed(_) if tier_winners.is_empty() => 0,
            TierShare::Fixed(amount) => amount,
        };
        reserved = add(reserved, amount)?;
        if tier_winners.is_empty() {
            treasury = add(treasury, amount)?;
            continue;
        }

        let count = tier_winners.len() as u64;
        let per_winner = amount / count;
        treasury = add(treasury, amount % count)?;
        if per_winner == 0 {
            continue;
        }
        for entry in tier_winners {
            let ticket = snapshot.get(&entry.ticket_id).ok_or_else(|| {
                EngineError::DataIntegrity(format!(
                    "winning ticket {} missing from snapshot",
                    entry.ticket_id
                ))
            })?;
            items.push(PayoutItem {
                ticket_id: entry.ticket_id.clone(),
                recipient: ticket.owner.clone(),
                tier: *tier,
                amount: per_winner,
                idempotency_key: idempotency_key(round.id, &entry.ticket_id, *tier),
            });
        }
    }
    if let Some(tier) = winners.keys().next() {
        return Err(EngineError::ArithmeticInvariant(format!(
            "match tier {tier} has no share in the tier table"
        )));
    }

    let unreserved = distributable.checked_sub(reserved).ok_or_else(|| {
        EngineError::ArithmeticInvariant(format!(
            "tier shares {reserved} exceed distributable pool {distributable}"
        ))
    })?;
    treasury = add(treasury, unreserved)?;
    items.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));

    let plan = PayoutPlan {
        round_id: round.id,
        prize_pool: pool,
        items,
        treasury_amount: treasury,
        house_cut,
    };
    if !plan.is_balanced() {
        return Err(EngineError::ArithmeticInvariant(format!(
            "plan for round {} does not balance: items {:?} + treasury {} != pool {}",
            round.id,
            plan.items_total(),
            plan.treasury_amount,
            pool
        )));
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::match_engine::compute_matches;
    use drawsettle_types::{Hash32, MatchingRule, NumberRules, PrizeMode, RoundConfig, Ticket, TierTable};
    use proptest::prelude::*;

    fn round(pool: u64, house_cut_bps: u32, tiers: TierTable) -> Round {
        let config = RoundConfig {
            numbers: NumberRules::default(),
            matching_rule: MatchingRule::Set,
            prize_mode: PrizeMode::Tiered,
            tiers,
            house_cut_bps,
            pool_account: "pool".to_string(),
            treasury_account: "treasury".to_string(),
        };
        Round::new(1, config, pool, Hash32::default(), 0).unwrap()
    }

    fn snapshot(ids: &[&str]) -> TicketSnapshot {
        TicketSnapshot::new(
            1,
            100,
            ids.iter()
                .map(|id| Ticket {
                    id: id.to_string(),
                    owner: format!("owner-{id}"),
                    numbers: [0; 6],
                    round_id: 1,
                    purchased_at_ms: 1,
                })
                .collect(),
        )
    }

    fn winner(id: &str, tier: u8) -> Match {
        Match {
            ticket_id: id.to_string(),
            match_count: tier,
            tier: Some(tier),
        }
    }

    fn loser(id: &str) -> Match {
        Match {
            ticket_id: id.to_string(),
            match_count: 1,
            tier: None,
        }
    }

    #[test]
    fn test_two_jackpot_winners_split_evenly() {
        let round = round(1_000, 0, TierTable::from([(6, TierShare::Bps(10_000))]));
        let matches = vec![winner("a", 6), winner("b", 6), loser("c"), loser("d")];
        let plan = plan(&round, &matches, &snapshot(&["a", "b", "c", "d"])).unwrap();
        assert_eq!(
            plan.items.iter().map(|i| (i.ticket_id.as_str(), i.amount)).collect::<Vec<_>>(),
            vec![("a", 500), ("b", 500)]
        );
        assert_eq!(plan.treasury_amount, 0);
        assert_eq!(plan.items[0].recipient, "owner-a");
        assert_eq!(plan.items[0].idempotency_key, idempotency_key(1, "a", 6));
    }

    #[test]
    fn test_split_remainder_goes_to_treasury() {
        let round = round(1_000, 0, TierTable::from([(6, TierShare::Bps(10_000))]));
        let matches = vec![winner("a", 6), winner("b", 6), winner("c", 6)];
        let plan = plan(&round, &matches, &snapshot(&["a", "b", "c"])).unwrap();
        assert!(plan.items.iter().all(|item| item.amount == 333));
        assert_eq!(plan.treasury_amount, 1);
        assert!(plan.is_balanced());
    }

    #[test]
    fn test_no_winners_routes_pool_to_treasury() {
        let round = round(
            1_000,
            500,
            TierTable::from([(6, TierShare::Bps(7_000)), (4, TierShare::Bps(2_000))]),
        );
        let plan = plan(&round, &[loser("a")], &snapshot(&["a"])).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.house_cut, 50);
        assert_eq!(plan.treasury_amount, 1_000);
    }

    #[test]
    fn test_house_cut_and_partial_tiers() {
        // 10_000 pool, 5% cut -> 9_500 distributable; jackpot 70% = 6_650,
        // tier 4 at 20% = 1_900 split over three winners.
        let round = round(
            10_000,
            500,
            TierTable::from([(6, TierShare::Bps(7_000)), (4, TierShare::Bps(2_000))]),
        );
        let matches = vec![winner("a", 6), winner("b", 4), winner("c", 4), winner("d", 4)];
        let plan = plan(&round, &matches, &snapshot(&["a", "b", "c", "d"])).unwrap();
        let amounts: Vec<_> = plan.items.iter().map(|item| item.amount).collect();
        assert_eq!(amounts, vec![6_650, 633, 633, 633]);
        // 500 cut + 1 remainder + 950 unreserved.
        assert_eq!(plan.treasury_amount, 1_451);
        assert!(plan.is_balanced());
    }

    #[test]
    fn test_zero_amount_items_omitted() {
        let round = round(2, 0, TierTable::from([(6, TierShare::Bps(10_000))]));
        let matches = vec![winner("a", 6), winner("b", 6), winner("c", 6)];
        let plan = plan(&round, &matches, &snapshot(&["a", "b", "c"])).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.treasury_amount, 2);
    }

    #[test]
    fn test_zero_pool() {
        let round = round(0, 0, TierTable::from([(6, TierShare::Bps(10_000))]));
        let plan = plan(&round, &[winner("a", 6)], &snapshot(&["a"])).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.treasury_amount, 0);
    }

    #[test]
    fn test_fixed_shares_exceeding_pool_rejected() {
        let round = round(100, 0, TierTable::from([(6, TierShare::Fixed(500))]));
        let err = plan(&round, &[winner("a", 6)], &snapshot(&["a"])).unwrap_err();
        assert!(matches!(err, EngineError::ArithmeticInvariant(_)));
    }

    #[test]
    fn test_unclaimed_fixed_tier_reserves_nothing() {
        let round = round(
            1_000,
            0,
            TierTable::from([(6, TierShare::Fixed(5_000)), (4, TierShare::Bps(5_000))]),
        );
        let plan = plan(&round, &[winner("a", 4)], &snapshot(&["a"])).unwrap();
        assert_eq!(plan.items[0].amount, 500);
        assert_eq!(plan.treasury_amount, 500);
    }

    #[test]
    fn test_missing_winner_ticket_is_integrity_error() {
        let round = round(1_000, 0, TierTable::from([(6, TierShare::Bps(10_000))]));
        let err = plan(&round, &[winner("ghost", 6)], &snapshot(&["a"])).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn test_four_ticket_jackpot_round() {
        let numbers: [(&str, [u8; 6]); 4] = [
            ("ticket-1", [1, 2, 3, 4, 5, 6]),
            ("ticket-2", [7, 8, 9, 0, 1, 2]),
            ("ticket-3", [1, 2, 3, 4, 5, 6]),
            ("ticket-4", [0, 0, 0, 0, 0, 0]),
        ];
        let tickets: Vec<Ticket> = numbers
            .iter()
            .map(|(id, numbers)| Ticket {
                id: id.to_string(),
                owner: format!("owner-{id}"),
                numbers: *numbers,
                round_id: 1,
                purchased_at_ms: 1,
            })
            .collect();
        let snapshot = TicketSnapshot::new(1, 100, tickets.clone());
        let draw = [1, 2, 3, 4, 5, 6];

        for rule in [MatchingRule::Set, MatchingRule::Positional] {
            let config = RoundConfig {
                numbers: NumberRules::default(),
                matching_rule: rule,
                prize_mode: PrizeMode::Tiered,
                tiers: TierTable::from([(6, TierShare::Bps(10_000))]),
                house_cut_bps: 0,
                pool_account: "pool".to_string(),
                treasury_account: "treasury".to_string(),
            };
            let round = Round::new(1, config, 1_000, Hash32::default(), 0).unwrap();
            let matches = compute_matches(&tickets, &draw, &round.config);
            let plan = plan(&round, &matches, &snapshot).unwrap();

            let paid = |id: &str| {
                plan.items
                    .iter()
                    .filter(|item| item.ticket_id == id)
                    .map(|item| item.amount)
                    .sum::<u64>()
            };
            assert_eq!(paid("ticket-1"), 500, "{rule:?}");
            assert_eq!(paid("ticket-2"), 0, "{rule:?}");
            assert_eq!(paid("ticket-3"), 500, "{rule:?}");
            assert_eq!(paid("ticket-4"), 0, "{rule:?}");
            assert_eq!(plan.items.len(), 2);
            assert_eq!(plan.treasury_amount, 0);
            assert!(plan.is_balanced());
        }
    }

    proptest! {
        #[test]
        fn prop_plan_conserves_pool(
            pool in 0u64..10_000_000_000,
            house_cut_bps in 0u32..=10_000,
            jackpot_bps in 1u32..=6_000,
            second_bps in 1u32..=4_000,
            winner_tiers in prop::collection::vec(prop::option::of(prop::sample::select(vec![4u8, 6])), 0..20),
        ) {
            let round = round(
                pool,
                house_cut_bps,
                TierTable::from([(6, TierShare::Bps(jackpot_bps)), (4, TierShare::Bps(second_bps))]),
            );
            let ids: Vec<String> = (0..winner_tiers.len()).map(|i| format!("t{i:02}")).collect();
            let matches: Vec<Match> = ids
                .iter()
                .zip(&winner_tiers)
                .map(|(id, tier)| match tier {
                    Some(tier) => winner(id, *tier),
                    None => loser(id),
                })
                .collect();
            let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let plan = plan(&round, &matches, &snapshot(&id_refs)).unwrap();
            prop_assert!(plan.is_balanced());
            prop_assert!(plan.items.iter().all(|item| item.amount > 0));
            prop_assert!(plan.treasury_amount >= plan.house_cut);
        }
    }
}
