//! Core domain model for SAPN: portal event categories, drafts and persisted events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sapn-core";

/// Portal record category. Ordering drives the section order of notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Absence,
    BehaviorAlert,
}

impl EventType {
    pub const ALL: [EventType; 2] = [EventType::Absence, EventType::BehaviorAlert];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Absence => "absence",
            EventType::BehaviorAlert => "behavior_alert",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event type `{0}`")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absence" => Ok(EventType::Absence),
            "behavior_alert" => Ok(EventType::BehaviorAlert),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

/// Normalized handoff contract from the normalizer into the reconciliation driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_id: String,
    pub event_type: EventType,
    pub date: NaiveDate,
    pub description: String,
    /// Serialized upstream record, kept for audit only.
    pub raw_payload: String,
}

/// Event as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub date: NaiveDate,
    pub description: String,
    pub raw_payload: String,
    pub first_seen: DateTime<Utc>,
    pub notified: bool,
}

impl From<CanonicalEvent> for EventDraft {
    fn from(event: CanonicalEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type,
            date: event.date,
            description: event.description,
            raw_payload: event.raw_payload,
        }
    }
}

/// Events handed to a notifier, grouped by category. Events carried over
/// from an earlier failed notification are counted apart from new ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBatch {
    groups: BTreeMap<EventType, Vec<EventDraft>>,
    retried: BTreeMap<EventType, usize>,
}

impl EventBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, draft: EventDraft) {
        self.groups.entry(draft.event_type).or_default().push(draft);
    }

    /// Adds an event that was stored earlier but never delivered.
    pub fn push_retried(&mut self, draft: EventDraft) {
        *self.retried.entry(draft.event_type).or_default() += 1;
        self.push(draft);
    }

    pub fn of_type(&self, event_type: EventType) -> &[EventDraft] {
        self.groups
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn absences(&self) -> &[EventDraft] {
        self.of_type(EventType::Absence)
    }

    pub fn behavior_alerts(&self) -> &[EventDraft] {
        self.of_type(EventType::BehaviorAlert)
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.of_type(event_type).len()
    }

    /// Events of this type seen for the first time in this cycle.
    pub fn new_count(&self, event_type: EventType) -> usize {
        self.count(event_type) - self.retried.get(&event_type).copied().unwrap_or(0)
    }

    pub fn retried_count(&self) -> usize {
        self.retried.values().sum()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-empty groups in category order.
    pub fn groups(&self) -> impl Iterator<Item = (EventType, &[EventDraft])> {
        self.groups
            .iter()
            .filter(|(_, drafts)| !drafts.is_empty())
            .map(|(event_type, drafts)| (*event_type, drafts.as_slice()))
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.groups
            .values()
            .flatten()
            .map(|d| d.event_id.clone())
            .collect()
    }
}

impl FromIterator<EventDraft> for EventBatch {
    fn from_iter<I: IntoIterator<Item = EventDraft>>(iter: I) -> Self {
        let mut batch = EventBatch::new();
        for draft in iter {
            batch.push(draft);
        }
        batch
    }
}

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub run_id: Uuid,
    pub new_absences: usize,
    pub new_behavior_alerts: usize,
    /// Previously persisted events whose earlier notification failed and were re-sent.
    pub retried_events: usize,
    pub email_sent: bool,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn empty(run_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        Self {
            run_id,
            new_absences: 0,
            new_behavior_alerts: 0,
            retried_events: 0,
            email_sent: false,
            timestamp,
        }
    }

    pub fn new_total(&self) -> usize {
        self.new_absences + self.new_behavior_alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(id: &str, event_type: EventType) -> EventDraft {
        EventDraft {
            event_id: id.to_string(),
            event_type,
            date: NaiveDate::from_ymd_opt(2025, 10, 3).unwrap(),
            description: format!("desc {id}"),
            raw_payload: "{}".to_string(),
        }
    }

    #[test]
    fn event_type_round_trips_through_str() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>(), Ok(event_type));
        }
        assert!("lateness".parse::<EventType>().is_err());
    }

    #[test]
    fn batch_groups_by_type_in_category_order() {
        let batch: EventBatch = vec![
            draft("b1", EventType::BehaviorAlert),
            draft("a1", EventType::Absence),
            draft("a2", EventType::Absence),
        ]
        .into_iter()
        .collect();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.count(EventType::Absence), 2);
        assert_eq!(batch.behavior_alerts().len(), 1);
        let order: Vec<_> = batch.groups().map(|(t, _)| t).collect();
        assert_eq!(order, vec![EventType::Absence, EventType::BehaviorAlert]);
        assert_eq!(batch.event_ids(), vec!["a1", "a2", "b1"]);
    }

    #[test]
    fn retried_events_are_counted_apart_from_new_ones() {
        let mut batch: EventBatch = vec![draft("a1", EventType::Absence)].into_iter().collect();
        batch.push_retried(draft("a0", EventType::Absence));
        batch.push_retried(draft("b0", EventType::BehaviorAlert));

        assert_eq!(batch.count(EventType::Absence), 2);
        assert_eq!(batch.new_count(EventType::Absence), 1);
        assert_eq!(batch.new_count(EventType::BehaviorAlert), 0);
        assert_eq!(batch.retried_count(), 2);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn empty_batch_reports_empty() {
        let batch = EventBatch::new();
        assert!(batch.is_empty());
        assert!(batch.absences().is_empty());
        assert_eq!(batch.groups().count(), 0);
    }
}
