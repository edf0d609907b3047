//! Audit export.

use crate::match_engine::compute_matches;
use drawsettle_types::{
    AuditDocument, AuditDraw, AuditRound, AuditTicketRow, DrawResult, Hash32, Match, PayoutPlan,
    Round, RoundEvent, SettlementRecord, TicketSnapshot,
};
use std::collections::HashMap;

/// Assemble the sealed audit document for a round.
///
/// Match counts are recomputed from the snapshot and a verified draw; they
/// are derived data and are never read from storage. Amounts come from the
/// accepted plan, statuses from the settlement records.
pub fn build_audit(
    round: &Round,
    snapshot: Option<&TicketSnapshot>,
    draw: Option<&DrawResult>,
    plan: Option<&PayoutPlan>,
    records: &[SettlementRecord],
    events: Vec<RoundEvent>,
    exported_at_ms: u64,
) -> AuditDocument {
    let computed = match (snapshot, draw) {
        (Some(snapshot), Some(draw)) if draw.is_verified() => {
            compute_matches(&snapshot.tickets, &draw.numbers, &round.config)
        }
        _ => Vec::new(),
    };
    let matches: HashMap<&str, &Match> = computed
        .iter()
        .map(|entry| (entry.ticket_id.as_str(), entry))
        .collect();
    let items: HashMap<&str, u64> = plan
        .map(|plan| {
            plan.items
                .iter()
                .map(|item| (item.ticket_id.as_str(), item.amount))
                .collect()
        })
        .unwrap_or_default();
    let settlements: HashMap<&str, &SettlementRecord> = records
        .iter()
        .map(|record| (record.ticket_id.as_str(), record))
        .collect();

    let tickets = snapshot
        .map(|snapshot| {
            snapshot
                .tickets
                .iter()
                .map(|ticket| {
                    let matched = matches.get(ticket.id.as_str());
                    let record = settlements.get(ticket.id.as_str());
                    AuditTicketRow {
                        ticket_id: ticket.id.clone(),
                        owner: ticket.owner.clone(),
                        numbers: ticket.numbers,
                        purchased_at_ms: ticket.purchased_at_ms,
                        match_count: matched.map(|entry| entry.match_count),
                        tier: matched.and_then(|entry| entry.tier),
                        amount: items.get(ticket.id.as_str()).copied().unwrap_or_default(),
                        idempotency_key: record.map(|record| record.idempotency_key.clone()),
                        settlement_status: record.map(|record| record.status),
                        tx_ref: record.and_then(|record| record.tx_ref.clone()),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    AuditDocument {
        round: AuditRound {
            id: round.id,
            status: round.status,
            prize_pool: round.prize_pool,
            house_cut_bps: round.config.house_cut_bps,
            matching_rule: round.config.matching_rule,
            prize_mode: round.config.prize_mode,
            tiers: round.config.tiers.clone(),
            config_digest: round.config_digest,
            opened_at_ms: round.opened_at_ms,
            closed_at_ms: round.closed_at_ms,
            snapshot_digest: round.snapshot_digest,
            failure: round.failure.clone(),
        },
        draw: draw.map(|draw| AuditDraw {
            numbers: draw.numbers,
            proof: draw.proof.clone(),
            commitment: draw.commitment,
            status: draw.status,
            recorded_at_ms: draw.recorded_at_ms,
        }),
        tickets,
        treasury_amount: plan.map(|plan| plan.treasury_amount),
        events,
        exported_at_ms,
        digest: Hash32::default(),
    }
    .seal()
}
