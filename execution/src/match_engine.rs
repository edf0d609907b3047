//! Ticket matching.
//!
//! Pure functions of (tickets, draw numbers, round config). Output is ordered
//! by ticket id so it never depends on the order tickets were read in.

use drawsettle_types::{Match, MatchingRule, Numbers, PrizeMode, RoundConfig, Ticket};

/// Count how many ticket numbers match the draw under `rule`.
pub fn count_matches(ticket: &Numbers, draw: &Numbers, rule: MatchingRule) -> u8 {
    match rule {
        MatchingRule::Positional => ticket
            .iter()
            .zip(draw.iter())
            .filter(|(t, d)| t == d)
            .count() as u8,
        MatchingRule::Set => {
            let mut seen = [false; 256];
            let mut count = 0u8;
            for &number in ticket {
                let slot = &mut seen[usize::from(number)];
                if !*slot && draw.contains(&number) {
                    *slot = true;
                    count += 1;
                }
            }
            count
        }
        MatchingRule::Multiset => {
            let mut remaining = [0u8; 256];
            for &number in draw {
                remaining[usize::from(number)] += 1;
            }
            let mut count = 0u8;
            for &number in ticket {
                let slot = &mut remaining[usize::from(number)];
                if *slot > 0 {
                    *slot -= 1;
                    count += 1;
                }
            }
            count
        }
    }
}

/// Match every ticket against the draw and assign prize tiers.
///
/// Under [`PrizeMode::Tiered`] a ticket's tier is its match count when the
/// tier table has an entry for it. Under [`PrizeMode::SingleWinner`] only the
/// best ticket keeps its tier; see [`select_single_winner`].
pub fn compute_matches(tickets: &[Ticket], draw: &Numbers, config: &RoundConfig) -> Vec<Match> {
    let mut matches: Vec<Match> = tickets
        .iter()
        .map(|ticket| {
            let match_count = count_matches(&ticket.numbers, draw, config.matching_rule);
            Match {
                ticket_id: ticket.id.clone(),
                match_count,
                tier: config
                    .tiers
                    .contains_key(&match_count)
                    .then_some(match_count),
            }
        })
        .collect();
    matches.sort_by(|a, b| a.ticket_id.cmp(&b.ticket_id));

    if config.prize_mode == PrizeMode::SingleWinner {
        let winner = select_single_winner(tickets, &matches).map(str::to_string);
        for entry in &mut matches {
            if winner.as_deref() != Some(entry.ticket_id.as_str()) {
                entry.tier = None;
            }
        }
    }
    matches
}

/// The single prize-eligible ticket: highest match count among tiered
/// matches, then earliest purchase, then smallest ticket id.
pub fn select_single_winner<'a>(tickets: &[Ticket], matches: &'a [Match]) -> Option<&'a str> {
    matches
        .iter()
        .filter(|entry| entry.tier.is_some())
        .filter_map(|entry| {
            tickets
                .iter()
                .find(|ticket| ticket.id == entry.ticket_id)
                .map(|ticket| (entry, ticket.purchased_at_ms))
        })
        .min_by(|(a, a_time), (b, b_time)| {
            b.match_count
                .cmp(&a.match_count)
                .then(a_time.cmp(b_time))
                .then(a.ticket_id.cmp(&b.ticket_id))
        })
        .map(|(entry, _)| entry.ticket_id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawsettle_types::{NumberRules, TierShare, TierTable};
    use proptest::prelude::*;

    fn config(rule: MatchingRule, mode: PrizeMode) -> RoundConfig {
        RoundConfig {
            numbers: NumberRules::default(),
            matching_rule: rule,
            prize_mode: mode,
            tiers: TierTable::from([(6, TierShare::Bps(7_000)), (4, TierShare::Bps(2_000))]),
            house_cut_bps: 0,
            pool_account: "pool".to_string(),
            treasury_account: "treasury".to_string(),
        }
    }

    fn ticket(id: &str, numbers: Numbers, purchased_at_ms: u64) -> Ticket {
        Ticket {
            id: id.to_string(),
            owner: format!("owner-{id}"),
            numbers,
            round_id: 1,
            purchased_at_ms,
        }
    }

    #[test]
    fn test_positional_matching() {
        let draw = [1, 2, 3, 4, 5, 6];
        assert_eq!(count_matches(&[1, 2, 3, 4, 5, 6], &draw, MatchingRule::Positional), 6);
        assert_eq!(count_matches(&[6, 5, 4, 3, 2, 1], &draw, MatchingRule::Positional), 0);
        assert_eq!(count_matches(&[1, 0, 3, 0, 5, 0], &draw, MatchingRule::Positional), 3);
    }

    #[test]
    fn test_set_matching_ignores_order() {
        let draw = [1, 2, 3, 4, 5, 6];
        assert_eq!(count_matches(&[6, 5, 4, 3, 2, 1], &draw, MatchingRule::Set), 6);
        assert_eq!(count_matches(&[1, 2, 3, 7, 8, 9], &draw, MatchingRule::Set), 3);
    }

    #[test]
    fn test_set_matching_counts_distinct_values() {
        let draw = [7, 7, 1, 2, 3, 4];
        assert_eq!(count_matches(&[7, 7, 7, 0, 0, 0], &draw, MatchingRule::Set), 1);
        assert_eq!(count_matches(&[7, 0, 0, 0, 0, 0], &draw, MatchingRule::Set), 1);
        assert_eq!(count_matches(&[0, 0, 0, 0, 0, 0], &[0; 6], MatchingRule::Set), 1);
        assert_eq!(count_matches(&[1, 1, 2, 2, 3, 3], &[1, 2, 3, 4, 5, 6], MatchingRule::Set), 3);
    }

    #[test]
    fn test_multiset_matching_counts_duplicates_once_per_draw() {
        let draw = [7, 7, 1, 2, 3, 4];
        assert_eq!(count_matches(&[7, 7, 7, 0, 0, 0], &draw, MatchingRule::Multiset), 2);
        assert_eq!(count_matches(&[7, 0, 0, 0, 0, 0], &draw, MatchingRule::Multiset), 1);
        assert_eq!(count_matches(&[0; 6], &[0; 6], MatchingRule::Multiset), 6);
    }

    #[test]
    fn test_tiers_assigned_from_table() {
        let tickets = vec![
            ticket("b", [1, 2, 3, 4, 0, 0], 1),
            ticket("a", [1, 2, 3, 4, 5, 6], 2),
            ticket("c", [1, 2, 3, 0, 0, 0], 3),
        ];
        let matches = compute_matches(
            &tickets,
            &[1, 2, 3, 4, 5, 6],
            &config(MatchingRule::Set, PrizeMode::Tiered),
        );
        assert_eq!(
            matches,
            vec![
                Match { ticket_id: "a".into(), match_count: 6, tier: Some(6) },
                Match { ticket_id: "b".into(), match_count: 4, tier: Some(4) },
                Match { ticket_id: "c".into(), match_count: 3, tier: None },
            ]
        );
    }

    #[test]
    fn test_single_winner_tie_break() {
        let tickets = vec![
            ticket("z", [1, 2, 3, 4, 0, 0], 5),
            ticket("y", [1, 2, 3, 4, 0, 0], 5),
            ticket("x", [1, 2, 3, 4, 0, 0], 9),
        ];
        let matches = compute_matches(
            &tickets,
            &[1, 2, 3, 4, 5, 6],
            &config(MatchingRule::Set, PrizeMode::SingleWinner),
        );
        let winners: Vec<_> = matches
            .iter()
            .filter(|entry| entry.tier.is_some())
            .map(|entry| entry.ticket_id.as_str())
            .collect();
        assert_eq!(winners, vec!["y"]);
    }

    #[test]
    fn test_single_winner_prefers_more_matches() {
        let tickets = vec![
            ticket("early", [1, 2, 3, 4, 0, 0], 1),
            ticket("late", [1, 2, 3, 4, 5, 6], 100),
        ];
        let matches = compute_matches(
            &tickets,
            &[1, 2, 3, 4, 5, 6],
            &config(MatchingRule::Set, PrizeMode::SingleWinner),
        );
        assert_eq!(select_single_winner(&tickets, &matches), Some("late"));
        assert_eq!(matches[0].tier, None);
    }

    #[test]
    fn test_no_winner_without_tiered_matches() {
        let tickets = vec![ticket("a", [0; 6], 1)];
        let matches = compute_matches(
            &tickets,
            &[1, 2, 3, 4, 5, 6],
            &config(MatchingRule::Set, PrizeMode::SingleWinner),
        );
        assert_eq!(select_single_winner(&tickets, &matches), None);
    }

    proptest! {
        #[test]
        fn prop_matches_independent_of_ticket_order(
            numbers in prop::collection::vec(prop::array::uniform6(0u8..10), 1..30),
            draw in prop::array::uniform6(0u8..10),
            rotate in 0usize..30,
            rule in prop_oneof![
                Just(MatchingRule::Positional),
                Just(MatchingRule::Set),
                Just(MatchingRule::Multiset),
            ],
        ) {
            let tickets: Vec<Ticket> = numbers
                .iter()
                .enumerate()
                .map(|(index, numbers)| ticket(&format!("t{index:03}"), *numbers, index as u64 % 3))
                .collect();
            let mut shuffled = tickets.clone();
            shuffled.reverse();
            let len = shuffled.len();
            shuffled.rotate_left(rotate % len);

            for mode in [PrizeMode::Tiered, PrizeMode::SingleWinner] {
                let config = config(rule, mode);
                prop_assert_eq!(
                    compute_matches(&tickets, &draw, &config),
                    compute_matches(&shuffled, &draw, &config)
                );
            }
        }

        #[test]
        fn prop_multiset_matches_at_least_positional_and_set(
            ticket_numbers in prop::array::uniform6(0u8..10),
            draw in prop::array::uniform6(0u8..10),
        ) {
            let positional = count_matches(&ticket_numbers, &draw, MatchingRule::Positional);
            let set = count_matches(&ticket_numbers, &draw, MatchingRule::Set);
            let multiset = count_matches(&ticket_numbers, &draw, MatchingRule::Multiset);
            prop_assert!(multiset >= positional);
            prop_assert!(multiset >= set);
            prop_assert!(multiset <= 6);
        }

        #[test]
        fn prop_rules_agree_on_distinct_numbers(
            ticket_numbers in prop::sample::subsequence((1u8..=40).collect::<Vec<_>>(), 6),
            draw in prop::sample::subsequence((1u8..=40).collect::<Vec<_>>(), 6),
        ) {
            let ticket_numbers: Numbers = ticket_numbers.try_into().unwrap();
            let draw: Numbers = draw.try_into().unwrap();
            prop_assert_eq!(
                count_matches(&ticket_numbers, &draw, MatchingRule::Set),
                count_matches(&ticket_numbers, &draw, MatchingRule::Multiset)
            );
        }
    }
}
