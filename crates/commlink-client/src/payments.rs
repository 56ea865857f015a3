//! Sent/received payment ledgers.
//!
//! Fed from two paths: server pushes (`payment_created`, `payment_updated`)
//! and periodic snapshots from the collaborator API. Both are idempotent so
//! a replayed event or an overlapping snapshot never changes the result.

use tracing::debug;

use commlink_shared::types::{PaymentEvent, PaymentUpdate, UserId};

pub struct PaymentTracker {
    local: UserId,
    /// Newest first.
    sent: Vec<PaymentEvent>,
    /// Newest first.
    received: Vec<PaymentEvent>,
}

impl PaymentTracker {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    pub fn sent(&self) -> &[PaymentEvent] {
        &self.sent
    }

    pub fn received(&self) -> &[PaymentEvent] {
        &self.received
    }

    /// Prepend `event` to every ledger the local user takes part in.
    /// Returns whether anything changed.
    pub fn on_created(&mut self, event: PaymentEvent) -> bool {
        let mut changed = false;
        if event.recipient_id == self.local {
            changed |= insert_front(&mut self.received, &event);
        }
        if event.sender_id == self.local {
            changed |= insert_front(&mut self.sent, &event);
        }
        if !changed {
            debug!(payment = %event.id, "Payment created event left ledgers unchanged");
        }
        changed
    }

    /// Apply a status change. Unknown ids are ignored.
    pub fn on_updated(&mut self, update: &PaymentUpdate) -> bool {
        let mut found = false;
        let mut changed = false;
        for ledger in [&mut self.received, &mut self.sent] {
            if let Some(p) = ledger.iter_mut().find(|p| p.id == update.id) {
                found = true;
                if p.status != update.status {
                    p.status = update.status.clone();
                    changed = true;
                }
            }
        }
        if !found {
            debug!(payment = %update.id, "Update for unknown payment ignored");
        }
        changed
    }

    pub fn reconcile_received(&mut self, snapshot: Vec<PaymentEvent>) -> bool {
        let local = self.local;
        merge(
            &mut self.received,
            snapshot.into_iter().filter(|p| p.recipient_id == local),
        )
    }

    pub fn reconcile_sent(&mut self, snapshot: Vec<PaymentEvent>) -> bool {
        let local = self.local;
        merge(
            &mut self.sent,
            snapshot.into_iter().filter(|p| p.sender_id == local),
        )
    }
}

fn insert_front(ledger: &mut Vec<PaymentEvent>, event: &PaymentEvent) -> bool {
    match ledger.iter_mut().find(|p| p.id == event.id) {
        Some(existing) if existing.status == event.status => false,
        Some(existing) => {
            existing.status = event.status.clone();
            true
        }
        None => {
            ledger.insert(0, event.clone());
            true
        }
    }
}

/// Fold a server snapshot into `ledger`: statuses are refreshed, missing
/// entries inserted, local entries the snapshot does not know are kept.
fn merge(ledger: &mut Vec<PaymentEvent>, snapshot: impl Iterator<Item = PaymentEvent>) -> bool {
    let mut changed = false;
    let mut inserted = false;
    for incoming in snapshot {
        match ledger.iter_mut().find(|p| p.id == incoming.id) {
            Some(existing) => {
                if existing.status != incoming.status {
                    existing.status = incoming.status;
                    changed = true;
                }
            }
            None => {
                ledger.push(incoming);
                inserted = true;
            }
        }
    }
    if inserted {
        ledger.sort_by(|a, b| b.created.cmp(&a.created));
    }
    changed || inserted
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    fn payment(id: &str, from: UserId, to: UserId, created: i64) -> PaymentEvent {
        PaymentEvent {
            id: id.into(),
            amount: 1500,
            currency: "usd".into(),
            status: "requires_payment_method".into(),
            created,
            sender_id: from,
            recipient_id: to,
            description: None,
        }
    }

    fn ids(ledger: &[PaymentEvent]) -> Vec<&str> {
        ledger.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_created_goes_to_one_ledger() {
        let mut tracker = PaymentTracker::new(ME);
        assert!(tracker.on_created(payment("pi_in", BOB, ME, 10)));
        assert!(tracker.on_created(payment("pi_out", ME, BOB, 20)));

        assert_eq!(ids(tracker.received()), vec!["pi_in"]);
        assert_eq!(ids(tracker.sent()), vec!["pi_out"]);
    }

    #[test]
    fn test_created_prepends_and_is_idempotent() {
        let mut tracker = PaymentTracker::new(ME);
        tracker.on_created(payment("a", BOB, ME, 1));
        tracker.on_created(payment("b", BOB, ME, 2));
        assert!(!tracker.on_created(payment("b", BOB, ME, 2)));

        assert_eq!(ids(tracker.received()), vec!["b", "a"]);
    }

    #[test]
    fn test_update_applies_status_only_and_twice_is_once() {
        let mut tracker = PaymentTracker::new(ME);
        tracker.on_created(payment("a", BOB, ME, 1));

        let update = PaymentUpdate {
            id: "a".into(),
            status: "succeeded".into(),
        };
        assert!(tracker.on_updated(&update));
        let once = tracker.received().to_vec();
        assert!(!tracker.on_updated(&update));
        assert_eq!(tracker.received(), once.as_slice());
        assert_eq!(once[0].status, "succeeded");
        assert_eq!(once[0].amount, 1500);
    }

    #[test]
    fn test_update_for_unknown_id_is_ignored() {
        let mut tracker = PaymentTracker::new(ME);
        assert!(!tracker.on_updated(&PaymentUpdate {
            id: "ghost".into(),
            status: "succeeded".into(),
        }));
        assert!(tracker.received().is_empty());
        assert!(tracker.sent().is_empty());
    }

    #[test]
    fn test_update_reaches_sent_ledger() {
        let mut tracker = PaymentTracker::new(ME);
        tracker.on_created(payment("out", ME, BOB, 1));
        assert!(tracker.on_updated(&PaymentUpdate {
            id: "out".into(),
            status: "succeeded".into(),
        }));
        assert_eq!(tracker.sent()[0].status, "succeeded");
    }

    #[test]
    fn test_snapshot_merge_is_idempotent() {
        let mut tracker = PaymentTracker::new(ME);
        tracker.on_created(payment("pushed", BOB, ME, 5));

        let mut settled = payment("pushed", BOB, ME, 5);
        settled.status = "succeeded".into();
        let snapshot = vec![payment("newer", BOB, ME, 9), settled, payment("older", BOB, ME, 1)];

        assert!(tracker.reconcile_received(snapshot.clone()));
        assert_eq!(ids(tracker.received()), vec!["newer", "pushed", "older"]);
        assert_eq!(tracker.received()[1].status, "succeeded");

        let before = tracker.received().to_vec();
        assert!(!tracker.reconcile_received(snapshot));
        assert_eq!(tracker.received(), before.as_slice());
    }

    #[test]
    fn test_snapshot_role_filter() {
        let mut tracker = PaymentTracker::new(ME);
        tracker.reconcile_received(vec![payment("x", ME, BOB, 1)]);
        tracker.reconcile_sent(vec![payment("y", BOB, ME, 1)]);
        assert!(tracker.received().is_empty());
        assert!(tracker.sent().is_empty());
    }
}
