//! Point-in-time ticket reads.

use crate::backoff::{retry_call, RetryPolicy};
use crate::error::EngineError;
use crate::services::TicketSource;
use drawsettle_types::{NumberRules, RoundId, Ticket, TicketSnapshot};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Reads the ticket set for a round as of its close time.
pub struct TicketReader<T> {
    source: T,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl<T: TicketSource> TicketReader<T> {
    pub fn new(source: T, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            source,
            retry,
            call_timeout,
        }
    }

    pub fn source(&self) -> &T {
        &self.source
    }

    /// Tickets for `round_id` purchased strictly before `as_of_ms`.
    ///
    /// Tickets at or after `as_of_ms` are dropped. Tickets belonging to
    /// another round, with invalid numbers, or with a repeated id are a data
    /// integrity error.
    pub async fn snapshot(
        &self,
        round_id: RoundId,
        as_of_ms: u64,
        rules: &NumberRules,
    ) -> Result<TicketSnapshot, EngineError> {
        let tickets = retry_call(&self.retry, self.call_timeout, "ticket read", || {
            self.source.list_tickets(round_id, as_of_ms)
        })
        .await?;
        let fetched = tickets.len();
        let tickets = validate_tickets(round_id, as_of_ms, rules, tickets)?;
        if tickets.len() != fetched {
            warn!(
                round_id,
                dropped = fetched - tickets.len(),
                "ticket source returned tickets purchased after close"
            );
        }
        let snapshot = TicketSnapshot::new(round_id, as_of_ms, tickets);
        debug!(round_id, tickets = snapshot.len(), digest = %snapshot.digest, "ticket snapshot");
        Ok(snapshot)
    }
}

fn validate_tickets(
    round_id: RoundId,
    as_of_ms: u64,
    rules: &NumberRules,
    tickets: Vec<Ticket>,
) -> Result<Vec<Ticket>, EngineError> {
    let mut seen = HashSet::with_capacity(tickets.len());
    let mut valid = Vec::with_capacity(tickets.len());
    for ticket in tickets {
        // Sales after the cut-off are not part of the round at all.
        if ticket.purchased_at_ms >= as_of_ms {
            continue;
        }
        if ticket.round_id != round_id {
            return Err(EngineError::DataIntegrity(format!(
                "ticket {} belongs to round {}, not {round_id}",
                ticket.id, ticket.round_id
            )));
        }
        if !seen.insert(ticket.id.clone()) {
            return Err(EngineError::DataIntegrity(format!(
                "ticket {} listed twice",
                ticket.id
            )));
        }
        if let Err(err) = rules.check(&ticket.numbers) {
            return Err(EngineError::DataIntegrity(format!(
                "ticket {} has invalid numbers: {err}",
                ticket.id
            )));
        }
        valid.push(ticket);
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::mocks::MockTicketSource;

    fn ticket(id: &str, purchased_at_ms: u64) -> Ticket {
        Ticket {
            id: id.to_string(),
            owner: format!("owner-{id}"),
            numbers: [1, 2, 3, 4, 5, 6],
            round_id: 1,
            purchased_at_ms,
        }
    }

    fn reader(source: MockTicketSource) -> TicketReader<MockTicketSource> {
        TicketReader::new(
            source,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_snapshot_excludes_tickets_at_or_after_close() {
        let source = MockTicketSource::new();
        source.add(ticket("b", 10));
        source.add(ticket("a", 99));
        source.add(ticket("late", 100));

        let snapshot = reader(source)
            .snapshot(1, 100, &NumberRules::default())
            .await
            .unwrap();
        let ids: Vec<_> = snapshot.tickets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_reads() {
        let source = MockTicketSource::new();
        source.add(ticket("a", 1));
        source.add(ticket("b", 2));
        let reader = reader(source);
        let first = reader.snapshot(1, 10, &NumberRules::default()).await.unwrap();
        let second = reader.snapshot(1, 10, &NumberRules::default()).await.unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[tokio::test]
    async fn test_snapshot_rejects_duplicate_ids() {
        let source = MockTicketSource::new();
        source.add(ticket("a", 1));
        source.add(ticket("a", 2));
        let err = reader(source)
            .snapshot(1, 10, &NumberRules::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[tokio::test]
    async fn test_snapshot_rejects_invalid_numbers() {
        let source = MockTicketSource::new();
        let mut bad = ticket("a", 1);
        bad.numbers = [1, 2, 3, 4, 5, 42];
        source.add(bad);
        let err = reader(source)
            .snapshot(1, 10, &NumberRules::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[tokio::test]
    async fn test_snapshot_ignores_bad_tickets_sold_after_close() {
        let source = MockTicketSource::new();
        source.add(ticket("a", 1));
        let mut late = ticket("late", 10);
        late.numbers = [1, 2, 3, 4, 5, 42];
        source.add(late);
        source.add(ticket("a", 11));

        let snapshot = reader(source)
            .snapshot(1, 10, &NumberRules::default())
            .await
            .unwrap();
        let ids: Vec<_> = snapshot.tickets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(snapshot.tickets[0].purchased_at_ms, 1);
    }

    #[tokio::test]
    async fn test_snapshot_retries_transient_failures() {
        let source = MockTicketSource::new();
        source.add(ticket("a", 1));
        source.fail_next(2, ServiceError::Unavailable("db restarting".into()));
        let snapshot = reader(source.clone())
            .snapshot(1, 10, &NumberRules::default())
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(source.calls(), 3);
    }
}
