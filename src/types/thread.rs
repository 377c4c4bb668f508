//! Thread dataset model
//!
//! `ThreadRecord`s are created by sync, mutated by the precompute pipeline
//! (AI fields only) and by user actions (label fields only). Status fields are
//! closed enums so merge logic stays exhaustive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::constants::labels;

/// Lifecycle of a generated field (summary, subject)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AiFieldStatus {
    #[default]
    None,
    Pending,
    Ready,
    Error,
}

/// Verdict state of one moderation rule on one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    #[default]
    Unset,
    Pending,
    Match,
    NotMatch,
    Unknown,
    Error,
}

/// Side effect recorded after a `Match` verdict was acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    LabelEnqueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ModerationEntry {
    pub status: ModerationStatus,
    pub rule_version: u32,
    pub evaluated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<ModerationAction>,
}

impl ModerationEntry {
    /// A `Match` is only done once its action has been taken
    pub fn is_done(&self) -> bool {
        match self.status {
            ModerationStatus::Match => self.action_taken.is_some(),
            ModerationStatus::NotMatch => true,
            ModerationStatus::Unset
            | ModerationStatus::Pending
            | ModerationStatus::Unknown
            | ModerationStatus::Error => false,
        }
    }

    pub fn needs_action(&self) -> bool {
        self.status == ModerationStatus::Match && self.action_taken.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThreadRecord {
    pub id: String,
    pub label_set: BTreeSet<String>,
    /// Labels removed locally that the server may still report
    pub pending_label_removals: BTreeSet<String>,

    pub latest_message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub snippet: Option<String>,
    pub received_at: Option<DateTime<Utc>>,

    pub summary_text: Option<String>,
    pub summary_status: AiFieldStatus,
    pub summary_updated_at: Option<DateTime<Utc>>,

    pub subject_text: Option<String>,
    pub subject_status: AiFieldStatus,
    pub subject_updated_at: Option<DateTime<Utc>>,
    pub subject_version: Option<u32>,

    pub content_fingerprint: Option<String>,
    pub moderation: BTreeMap<String, ModerationEntry>,
}

impl ThreadRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_set = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_set.contains(label)
    }

    /// In the inbox view and not trashed or spam
    pub fn is_inbox_visible(&self) -> bool {
        self.has_label(labels::INBOX) && !labels::EXCLUDED.iter().any(|l| self.has_label(l))
    }

    pub fn has_summary(&self) -> bool {
        self.summary_text.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    pub fn has_subject(&self) -> bool {
        self.subject_text.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    /// Summary work is due. A fresh pending marker means another run owns it.
    pub fn needs_summary(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.summary_status {
            AiFieldStatus::None | AiFieldStatus::Error => true,
            AiFieldStatus::Ready => !self.has_summary(),
            AiFieldStatus::Pending => {
                !self.has_summary() && is_stale(self.summary_updated_at, now, stale_after)
            }
        }
    }

    /// Subject work is due, including when the subject prompt version moved on
    pub fn needs_subject(
        &self,
        version: u32,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> bool {
        let stale_version = self.subject_version.is_some_and(|v| v < version);
        match self.subject_status {
            AiFieldStatus::None | AiFieldStatus::Error => true,
            AiFieldStatus::Ready => !self.has_subject() || stale_version,
            AiFieldStatus::Pending => {
                is_stale(self.subject_updated_at, now, stale_after)
                    && (!self.has_subject() || stale_version)
            }
        }
    }

    /// Mark summary in flight. Never applied over an existing summary.
    pub fn mark_summary_pending(&mut self, now: DateTime<Utc>) -> bool {
        if self.has_summary() {
            return false;
        }
        self.summary_status = AiFieldStatus::Pending;
        self.summary_updated_at = Some(now);
        true
    }

    /// Mark subject in flight. Never applied over an existing subject.
    pub fn mark_subject_pending(&mut self, now: DateTime<Utc>) -> bool {
        if self.has_subject() {
            return false;
        }
        self.subject_status = AiFieldStatus::Pending;
        self.subject_updated_at = Some(now);
        true
    }

    /// Mark a moderation rule in flight. An unactioned match is left alone so
    /// its label action stays due; `evaluated_at` doubles as the marker time.
    pub fn mark_moderation_pending(&mut self, rule_id: &str, rule_version: u32, now: DateTime<Utc>) {
        let entry = self.moderation.entry(rule_id.to_string()).or_default();
        if entry.needs_action() {
            return;
        }
        entry.status = ModerationStatus::Pending;
        entry.rule_version = rule_version;
        entry.evaluated_at = Some(now);
    }

    // =========================================================================
    // Label state
    // =========================================================================

    /// User action: remove a label locally; survives stale sync snapshots
    pub fn remove_label_locally(&mut self, label: &str) {
        self.label_set.remove(label);
        self.pending_label_removals.insert(label.to_string());
    }

    /// User action: add a label locally, cancelling a pending removal
    pub fn add_label_locally(&mut self, label: &str) {
        self.pending_label_removals.remove(label);
        self.label_set.insert(label.to_string());
    }

    /// Merge the label set from a sync snapshot.
    ///
    /// Locally removed labels stay removed while the snapshot still carries
    /// them; the tombstone clears once the snapshot agrees.
    pub fn merge_synced_labels<I, S>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let incoming: BTreeSet<String> = incoming.into_iter().map(Into::into).collect();
        self.pending_label_removals
            .retain(|label| incoming.contains(label));
        self.label_set = incoming
            .difference(&self.pending_label_removals)
            .cloned()
            .collect();
    }
}

fn is_stale(at: Option<DateTime<Utc>>, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
    at.is_none_or(|t| now - t >= stale_after)
}
