//! Conversation log and the reconciliation rules that keep it ordered.
//!
//! The remote endpoint finishes transcribing the user's utterance and
//! finishes speaking its answer independently, so the assistant transcript
//! regularly arrives first. Every push-to-talk press opens a user turn, and
//! turns resolve (final or rejected) in the order they were opened. Each
//! assistant reply is attributed to the oldest turn that has not been
//! answered yet. A reply whose turn is still unresolved waits in `pending`
//! and is flushed right behind that turn's user entry. A reply to a turn
//! that was rejected as noise never reaches the log.
//!
//! The log shows at most one ephemeral row, standing for the oldest
//! unresolved turn.

use crate::filter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Speaking,
    Processing,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationEntry {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_final: bool,
    pub status: EntryStatus,
}

impl ConversationEntry {
    fn ephemeral_user(status: EntryStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            text: String::new(),
            timestamp: Utc::now(),
            is_final: false,
            status,
        }
    }

    pub fn final_assistant(id: Option<&str>, text: &str) -> Self {
        Self {
            id: id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            role: Role::Assistant,
            text: text.trim().to_string(),
            timestamp: Utc::now(),
            is_final: true,
            status: EntryStatus::Final,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    /// The user entry is final; `flushed` queued assistant entries followed it.
    Accepted { flushed: usize },
    /// Filtered as noise; `dropped` queued assistant entries went with it.
    Rejected { dropped: usize },
    /// This remote item was already finalized or rejected.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantOutcome {
    Appended,
    Queued,
    /// The reply answers a turn that was rejected.
    Dropped,
    Empty,
}

#[derive(Debug, Default)]
pub struct Conversation {
    entries: Vec<ConversationEntry>,
    /// Id of the in-progress user entry, if any. At most one.
    ephemeral: Option<String>,
    /// Replies waiting on their user turn, tagged with that turn's number.
    pending: VecDeque<(u64, ConversationEntry)>,
    /// Remote item ids whose user transcription has already been resolved.
    resolved_items: HashSet<String>,
    /// User turns opened so far. Turn numbers start at 1.
    opened: u64,
    /// Turns resolved so far; always `<= opened`.
    resolved: u64,
    /// Turns a reply has been attributed to; always `<= opened`.
    answered: u64,
    /// Set once the in-flight response has produced its transcript.
    reply_seen: bool,
    rejected: HashSet<u64>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn ephemeral_id(&self) -> Option<&str> {
        self.ephemeral.as_deref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Turns opened but not yet finalized or rejected.
    pub fn open_turns(&self) -> u64 {
        self.opened - self.resolved
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn ephemeral_entry_mut(&mut self) -> Option<&mut ConversationEntry> {
        let id = self.ephemeral.as_deref()?;
        self.entries.iter_mut().find(|e| e.id == id)
    }

    fn ephemeral_index(&self) -> Option<usize> {
        let id = self.ephemeral.as_deref()?;
        self.entries.iter().position(|e| e.id == id)
    }

    fn show_ephemeral(&mut self, status: EntryStatus) -> String {
        if let Some(entry) = self.ephemeral_entry_mut() {
            entry.status = status;
            return entry.id.clone();
        }
        let entry = ConversationEntry::ephemeral_user(status);
        let id = entry.id.clone();
        self.entries.push(entry);
        self.ephemeral = Some(id.clone());
        id
    }

    /// Opens a new user turn (push-to-talk press).
    pub fn begin_turn(&mut self) -> String {
        self.opened += 1;
        self.show_ephemeral(EntryStatus::Speaking)
    }

    /// Makes sure a user turn is open and shown, and sets its status.
    /// Opens a turn only when none is outstanding.
    pub fn ensure_ephemeral(&mut self, status: EntryStatus) -> String {
        if self.opened == self.resolved {
            self.opened += 1;
        }
        self.show_ephemeral(status)
    }

    /// Updates the status of the ephemeral entry; no-op when there is none.
    pub fn mark_ephemeral(&mut self, status: EntryStatus) {
        if let Some(entry) = self.ephemeral_entry_mut() {
            entry.status = status;
        }
    }

    pub fn append_delta(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        self.ensure_ephemeral(EntryStatus::Speaking);
        if let Some(entry) = self.ephemeral_entry_mut() {
            entry.text.push_str(fragment);
        }
    }

    /// Resolves the oldest open turn and returns its number.
    fn resolve_turn(&mut self) -> u64 {
        if self.opened == self.resolved {
            self.opened += 1;
        }
        self.resolved += 1;
        self.resolved
    }

    /// Shows the next open turn, if any, once the previous one left the log.
    fn show_next_turn(&mut self) {
        if self.open_turns() > 0 {
            self.show_ephemeral(EntryStatus::Processing);
        }
    }

    /// Resolves the oldest open user turn with its completed transcription.
    pub fn finalize_user(&mut self, item_id: Option<&str>, transcript: &str) -> UserOutcome {
        if let Some(item) = item_id {
            if !self.resolved_items.insert(item.to_string()) {
                return UserOutcome::Duplicate;
            }
        }

        if !filter::is_valid(transcript) {
            log::info!("[conversation] dropping noise transcription: {:?}", transcript);
            return UserOutcome::Rejected {
                dropped: self.reject_turn(),
            };
        }

        let turn = self.resolve_turn();
        let text = transcript.trim().to_string();
        let id = self
            .ephemeral
            .take()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match self.entries.iter().position(|e| e.id == id) {
            Some(idx) => {
                let entry = &mut self.entries[idx];
                entry.text = text;
                entry.is_final = true;
                entry.status = EntryStatus::Final;
            }
            None => self.entries.push(final_user(id, text)),
        }

        let mut flushed = 0;
        while self.pending.front().map_or(false, |(t, _)| *t <= turn) {
            if let Some((_, entry)) = self.pending.pop_front() {
                self.entries.push(entry);
                flushed += 1;
            }
        }
        self.show_next_turn();
        UserOutcome::Accepted { flushed }
    }

    /// Rejects the oldest open turn: its ephemeral row, anything queued
    /// behind it, and any reply that arrives for it later are dropped.
    /// Returns how many queued assistant entries were dropped.
    pub fn discard_user_turn(&mut self) -> usize {
        if self.open_turns() == 0 && self.ephemeral.is_none() {
            return 0;
        }
        self.reject_turn()
    }

    fn reject_turn(&mut self) -> usize {
        let turn = self.resolve_turn();
        self.rejected.insert(turn);
        if let Some(id) = self.ephemeral.take() {
            self.entries.retain(|e| e.id != id);
        }
        let before = self.pending.len();
        self.pending.retain(|(t, _)| *t > turn);
        self.show_next_turn();
        before - self.pending.len()
    }

    pub fn push_assistant(&mut self, entry: ConversationEntry) -> AssistantOutcome {
        if entry.text.is_empty() {
            return AssistantOutcome::Empty;
        }
        self.reply_seen = true;
        if self.opened == 0 {
            return self.append_assistant(entry);
        }
        // Surplus replies stay with the latest turn.
        self.answered = (self.answered + 1).min(self.opened);
        let turn = self.answered;
        if turn > self.resolved {
            self.pending.push_back((turn, entry));
            return AssistantOutcome::Queued;
        }
        if self.rejected.contains(&turn) {
            log::info!("[conversation] dropping reply to rejected turn {}", turn);
            return AssistantOutcome::Dropped;
        }
        self.append_assistant(entry)
    }

    /// A response finished. One without a transcript still answers a turn.
    pub fn complete_response(&mut self) {
        if !std::mem::take(&mut self.reply_seen) && self.answered < self.opened {
            self.answered += 1;
        }
    }

    fn append_assistant(&mut self, entry: ConversationEntry) -> AssistantOutcome {
        self.entries
            .retain(|e| e.role != Role::Assistant || e.is_final);
        // The ephemeral row belongs to a later turn than this reply.
        match self.ephemeral_index() {
            Some(idx) => self.entries.insert(idx, entry),
            None => self.entries.push(entry),
        }
        AssistantOutcome::Appended
    }

    /// Forgets the in-progress user turns at teardown; they can never finalize.
    pub fn clear_ephemeral(&mut self) {
        if let Some(id) = self.ephemeral.take() {
            self.entries.retain(|e| e.id != id || e.is_final);
        }
        self.pending.clear();
        self.resolved = self.opened;
        self.answered = self.opened;
        self.reply_seen = false;
    }
}

fn final_user(id: String, text: String) -> ConversationEntry {
    ConversationEntry {
        id,
        role: Role::User,
        text,
        timestamp: Utc::now(),
        is_final: true,
        status: EntryStatus::Final,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(text: &str) -> ConversationEntry {
        ConversationEntry::final_assistant(None, text)
    }

    fn roles_and_text(conv: &Conversation) -> Vec<(Role, &str, bool)> {
        conv.entries()
            .iter()
            .map(|e| (e.role, e.text.as_str(), e.is_final))
            .collect()
    }

    #[test]
    fn user_then_assistant_in_order() {
        let mut conv = Conversation::new();
        conv.ensure_ephemeral(EntryStatus::Speaking);
        assert_eq!(
            conv.finalize_user(Some("item_1"), "こんにちは"),
            UserOutcome::Accepted { flushed: 0 }
        );
        assert_eq!(
            conv.push_assistant(assistant("こんにちは、元気ですか")),
            AssistantOutcome::Appended
        );
        assert_eq!(
            roles_and_text(&conv),
            vec![
                (Role::User, "こんにちは", true),
                (Role::Assistant, "こんにちは、元気ですか", true),
            ]
        );
    }

    #[test]
    fn assistant_arriving_first_waits_for_user() {
        let mut conv = Conversation::new();
        conv.ensure_ephemeral(EntryStatus::Speaking);
        assert_eq!(conv.push_assistant(assistant("はい、どうぞ")), AssistantOutcome::Queued);
        assert_eq!(conv.entries().len(), 1);
        assert!(!conv.entries()[0].is_final);

        assert_eq!(
            conv.finalize_user(None, "質問があります"),
            UserOutcome::Accepted { flushed: 1 }
        );
        assert_eq!(
            roles_and_text(&conv),
            vec![
                (Role::User, "質問があります", true),
                (Role::Assistant, "はい、どうぞ", true),
            ]
        );
        assert_eq!(conv.pending_len(), 0);
    }

    #[test]
    fn queued_entries_flush_in_arrival_order() {
        let mut conv = Conversation::new();
        conv.ensure_ephemeral(EntryStatus::Processing);
        conv.push_assistant(assistant("一つ目"));
        conv.push_assistant(assistant("二つ目"));
        conv.finalize_user(None, "二つ答えてください");
        let texts: Vec<_> = conv.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["二つ答えてください", "一つ目", "二つ目"]);
    }

    #[test]
    fn noise_drops_user_turn_and_queued_answers() {
        let mut conv = Conversation::new();
        conv.ensure_ephemeral(EntryStatus::Speaking);
        conv.push_assistant(assistant("どういたしまして"));
        assert_eq!(
            conv.finalize_user(Some("item_9"), "ご視聴ありがとうございました"),
            UserOutcome::Rejected { dropped: 1 }
        );
        assert!(conv.entries().is_empty());
        assert!(conv.ephemeral_id().is_none());
        assert_eq!(conv.pending_len(), 0);
    }

    #[test]
    fn finalizing_replaces_ephemeral_in_place() {
        let mut conv = Conversation::new();
        let id = conv.ensure_ephemeral(EntryStatus::Speaking);
        conv.append_delta("こん");
        conv.append_delta("にちは");
        assert_eq!(conv.entries()[0].text, "こんにちは");
        // A second speech event must not create another ephemeral entry.
        assert_eq!(conv.ensure_ephemeral(EntryStatus::Processing), id);
        assert_eq!(conv.entries().len(), 1);
        assert_eq!(conv.entries()[0].status, EntryStatus::Processing);

        conv.finalize_user(None, "こんにちは");
        assert_eq!(conv.entries().len(), 1);
        let entry = &conv.entries()[0];
        assert_eq!(entry.id, id);
        assert!(entry.is_final);
        assert_eq!(entry.status, EntryStatus::Final);
        assert!(conv.ephemeral_id().is_none());
    }

    #[test]
    fn same_item_is_only_resolved_once() {
        let mut conv = Conversation::new();
        conv.finalize_user(Some("item_1"), "おはようございます");
        assert_eq!(
            conv.finalize_user(Some("item_1"), "おはようございます"),
            UserOutcome::Duplicate
        );
        assert_eq!(conv.entries().len(), 1);
    }

    #[test]
    fn user_final_without_speech_events_still_appends() {
        let mut conv = Conversation::new();
        conv.finalize_user(None, "もう一度お願いします");
        assert_eq!(
            roles_and_text(&conv),
            vec![(Role::User, "もう一度お願いします", true)]
        );
    }

    #[test]
    fn direct_append_clears_stray_partial_assistant_entries() {
        let mut conv = Conversation::new();
        conv.entries.push(ConversationEntry {
            id: "partial".into(),
            role: Role::Assistant,
            text: "途中".into(),
            timestamp: Utc::now(),
            is_final: false,
            status: EntryStatus::Speaking,
        });
        conv.push_assistant(assistant("完成した文です"));
        assert_eq!(
            roles_and_text(&conv),
            vec![(Role::Assistant, "完成した文です", true)]
        );
    }

    #[test]
    fn empty_assistant_text_is_ignored() {
        let mut conv = Conversation::new();
        assert_eq!(conv.push_assistant(assistant("  ")), AssistantOutcome::Empty);
        assert!(conv.entries().is_empty());
    }

    #[test]
    fn clear_ephemeral_keeps_final_entries() {
        let mut conv = Conversation::new();
        conv.finalize_user(None, "さようなら、また明日");
        conv.ensure_ephemeral(EntryStatus::Speaking);
        assert_eq!(conv.entries().len(), 2);
        conv.clear_ephemeral();
        assert_eq!(conv.entries().len(), 1);
        assert!(conv.entries()[0].is_final);
        assert!(conv.ephemeral_id().is_none());
    }

    #[test]
    fn reply_after_rejected_turn_is_dropped() {
        let mut conv = Conversation::new();
        conv.begin_turn();
        conv.mark_ephemeral(EntryStatus::Processing);
        assert_eq!(
            conv.finalize_user(Some("u1"), "ご視聴ありがとうございました"),
            UserOutcome::Rejected { dropped: 0 }
        );
        assert_eq!(
            conv.push_assistant(assistant("どういたしまして")),
            AssistantOutcome::Dropped
        );
        conv.complete_response();
        assert!(conv.entries().is_empty());

        // The next turn is unaffected.
        conv.begin_turn();
        conv.finalize_user(Some("u2"), "今日は何曜日ですか");
        assert_eq!(
            conv.push_assistant(assistant("金曜日です")),
            AssistantOutcome::Appended
        );
        assert_eq!(
            roles_and_text(&conv),
            vec![
                (Role::User, "今日は何曜日ですか", true),
                (Role::Assistant, "金曜日です", true),
            ]
        );
    }

    #[test]
    fn failed_transcription_also_drops_the_late_reply() {
        let mut conv = Conversation::new();
        conv.begin_turn();
        conv.discard_user_turn();
        assert_eq!(
            conv.push_assistant(assistant("もう一度言ってください")),
            AssistantOutcome::Dropped
        );
        assert!(conv.entries().is_empty());
        assert_eq!(conv.discard_user_turn(), 0);
    }

    #[test]
    fn overlapping_turns_keep_each_reply_behind_its_user_entry() {
        let mut conv = Conversation::new();
        let first = conv.begin_turn();
        // Second press before the first transcript: still one ephemeral row.
        assert_eq!(conv.begin_turn(), first);
        assert_eq!(conv.entries().len(), 1);
        assert_eq!(conv.open_turns(), 2);

        conv.finalize_user(Some("a"), "質問が一つあります");
        assert!(conv.ephemeral_id().is_some());
        assert_eq!(conv.push_assistant(assistant("どうぞ")), AssistantOutcome::Appended);
        assert_eq!(conv.push_assistant(assistant("東京です")), AssistantOutcome::Queued);
        conv.finalize_user(Some("b"), "首都はどこですか");

        assert_eq!(
            roles_and_text(&conv),
            vec![
                (Role::User, "質問が一つあります", true),
                (Role::Assistant, "どうぞ", true),
                (Role::User, "首都はどこですか", true),
                (Role::Assistant, "東京です", true),
            ]
        );
        assert_eq!(conv.open_turns(), 0);
        assert!(conv.ephemeral_id().is_none());
    }

    #[test]
    fn response_without_transcript_still_answers_its_turn() {
        let mut conv = Conversation::new();
        conv.begin_turn();
        conv.begin_turn();
        conv.finalize_user(None, "一つ目の質問");
        // Turn one's response carried no audio transcript.
        conv.complete_response();
        assert_eq!(conv.push_assistant(assistant("二つ目の答え")), AssistantOutcome::Queued);
        conv.complete_response();
        conv.finalize_user(None, "二つ目の質問");
        let texts: Vec<_> = conv.entries().iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["一つ目の質問", "二つ目の質問", "二つ目の答え"]);
    }
}
