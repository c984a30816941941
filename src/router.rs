//! Inbound event dispatch.
//!
//! Each control-channel message is parsed and applied to the session state
//! before the next one is looked at, so handlers never interleave.

use crate::conversation::{
    AssistantOutcome, Conversation, ConversationEntry, EntryStatus, UserOutcome,
};
use crate::error::SessionError;
use crate::ptt::PushToTalk;
use crate::realtime::{self, ServerEvent};
use crate::usage::UsageAccountant;

/// Error code the remote sends when a commit carried no audio.
const COMMIT_EMPTY: &str = "input_audio_buffer_commit_empty";

/// Everything the router is allowed to mutate.
#[derive(Debug, Default)]
pub struct SessionState {
    pub conversation: Conversation,
    pub usage: UsageAccountant,
    pub ptt: PushToTalk,
}

#[derive(Debug)]
pub enum RouteOutcome {
    LogChanged,
    UsageRecorded,
    /// The remote reported an error. The session carries on.
    RemoteError(SessionError),
    Ignored,
}

/// Parses and routes one raw message. A parse failure is logged and dropped.
pub fn dispatch(state: &mut SessionState, raw: &str) -> RouteOutcome {
    match realtime::parse_event(raw) {
        Ok(event) => route(state, event),
        Err(e) => {
            log::warn!("[session] {}", e);
            RouteOutcome::Ignored
        }
    }
}

pub fn route(state: &mut SessionState, event: ServerEvent) -> RouteOutcome {
    match event {
        ServerEvent::SpeechStarted { .. } | ServerEvent::SpeechStopped { .. } => {
            state.conversation.ensure_ephemeral(EntryStatus::Speaking);
            RouteOutcome::LogChanged
        }
        ServerEvent::BufferCommitted { item_id } => {
            log::debug!("[session] buffer committed: {:?}", item_id);
            state.conversation.mark_ephemeral(EntryStatus::Processing);
            state.ptt.settle();
            RouteOutcome::LogChanged
        }
        ServerEvent::TranscriptionDelta { delta, .. } => {
            if delta.is_empty() {
                return RouteOutcome::Ignored;
            }
            state.conversation.append_delta(&delta);
            RouteOutcome::LogChanged
        }
        ServerEvent::TranscriptionCompleted {
            item_id,
            transcript,
        } => finalize_user(&mut state.conversation, item_id.as_deref(), &transcript),
        ServerEvent::TranscriptionFailed { item_id, error } => {
            log::warn!(
                "[session] transcription failed for {:?}: {}",
                item_id,
                error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "no details".into())
            );
            let dropped = state.conversation.discard_user_turn();
            if dropped > 0 {
                log::info!("[session] dropped {} queued assistant entries", dropped);
            }
            RouteOutcome::LogChanged
        }
        // Some endpoints put the user transcript on the created item instead of
        // sending a separate completion event.
        ServerEvent::ItemCreated { item } => match item.user_transcript() {
            Some(transcript) => {
                let transcript = transcript.to_string();
                finalize_user(&mut state.conversation, item.id.as_deref(), &transcript)
            }
            None => RouteOutcome::Ignored,
        },
        // Partial assistant text is not rendered; the done event carries all of it.
        ServerEvent::ResponseTranscriptDelta { .. } => RouteOutcome::Ignored,
        ServerEvent::ResponseTranscriptDone {
            item_id,
            transcript,
        } => {
            let entry = ConversationEntry::final_assistant(item_id.as_deref(), &transcript);
            match state.conversation.push_assistant(entry) {
                AssistantOutcome::Appended => RouteOutcome::LogChanged,
                AssistantOutcome::Queued => {
                    log::debug!("[session] assistant reply queued behind user turn");
                    RouteOutcome::Ignored
                }
                AssistantOutcome::Dropped | AssistantOutcome::Empty => RouteOutcome::Ignored,
            }
        }
        ServerEvent::ResponseDone { response } => {
            log::debug!(
                "[session] response {:?} done: {:?}",
                response.id,
                response.status
            );
            state.usage.record(response.usage.as_ref());
            state.conversation.complete_response();
            state.ptt.settle();
            RouteOutcome::UsageRecorded
        }
        ServerEvent::Error { error } => {
            if error.code.as_deref() == Some(COMMIT_EMPTY) {
                log::debug!("[session] commit carried no audio");
                state.conversation.discard_user_turn();
                state.ptt.settle();
                return RouteOutcome::LogChanged;
            }
            let err = SessionError::ProtocolError {
                code: error.code,
                message: error.message.unwrap_or_default(),
            };
            log::error!("[session] {}", err);
            RouteOutcome::RemoteError(err)
        }
        ServerEvent::Unknown => RouteOutcome::Ignored,
    }
}

fn finalize_user(
    conversation: &mut Conversation,
    item_id: Option<&str>,
    transcript: &str,
) -> RouteOutcome {
    match conversation.finalize_user(item_id, transcript) {
        UserOutcome::Accepted { flushed } => {
            if flushed > 0 {
                log::debug!("[session] flushed {} queued assistant entries", flushed);
            }
            RouteOutcome::LogChanged
        }
        UserOutcome::Rejected { .. } => RouteOutcome::LogChanged,
        UserOutcome::Duplicate => RouteOutcome::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::ptt::PttState;

    fn texts(state: &SessionState) -> Vec<(Role, String, bool)> {
        state
            .conversation
            .entries()
            .iter()
            .map(|e| (e.role, e.text.clone(), e.is_final))
            .collect()
    }

    #[test]
    fn speech_then_transcription_finalizes_user_entry() {
        let mut state = SessionState::default();
        dispatch(&mut state, r#"{"type":"input_audio_buffer.speech_started","item_id":"i1"}"#);
        dispatch(&mut state, r#"{"type":"input_audio_buffer.committed","item_id":"i1"}"#);
        assert_eq!(
            state.conversation.entries()[0].status,
            EntryStatus::Processing
        );
        dispatch(
            &mut state,
            r#"{"type":"conversation.item.input_audio_transcription.delta","item_id":"i1","delta":"こん"}"#,
        );
        assert_eq!(state.conversation.entries()[0].text, "こん");
        dispatch(
            &mut state,
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"i1","transcript":"こんにちは"}"#,
        );
        assert_eq!(texts(&state), vec![(Role::User, "こんにちは".into(), true)]);
        assert!(state.conversation.ephemeral_id().is_none());
    }

    #[test]
    fn assistant_before_user_is_reordered() {
        let mut state = SessionState::default();
        state.conversation.ensure_ephemeral(EntryStatus::Speaking);
        dispatch(
            &mut state,
            r#"{"type":"response.output_audio_transcript.done","item_id":"a1","transcript":"元気です"}"#,
        );
        assert_eq!(state.conversation.pending_len(), 1);
        dispatch(
            &mut state,
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"u1","transcript":"お元気ですか"}"#,
        );
        assert_eq!(
            texts(&state),
            vec![
                (Role::User, "お元気ですか".into(), true),
                (Role::Assistant, "元気です".into(), true),
            ]
        );
    }

    #[test]
    fn item_created_with_transcript_counts_once() {
        let mut state = SessionState::default();
        state.conversation.ensure_ephemeral(EntryStatus::Processing);
        let created = r#"{"type":"conversation.item.created","item":{"id":"u1","role":"user","content":[{"type":"input_audio","transcript":"ありがとう"}]}}"#;
        let completed = r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"u1","transcript":"ありがとう"}"#;
        assert!(matches!(dispatch(&mut state, created), RouteOutcome::LogChanged));
        assert!(matches!(dispatch(&mut state, completed), RouteOutcome::Ignored));
        assert_eq!(state.conversation.entries().len(), 1);
    }

    #[test]
    fn failed_transcription_drops_turn_and_queue() {
        let mut state = SessionState::default();
        state.conversation.ensure_ephemeral(EntryStatus::Processing);
        state
            .conversation
            .push_assistant(ConversationEntry::final_assistant(None, "はい"));
        dispatch(
            &mut state,
            r#"{"type":"conversation.item.input_audio_transcription.failed","item_id":"u1","error":{"message":"bad audio"}}"#,
        );
        assert!(state.conversation.entries().is_empty());
        assert_eq!(state.conversation.pending_len(), 0);
    }

    #[test]
    fn response_done_records_usage_and_settles_ptt() {
        let mut state = SessionState::default();
        state.usage.start();
        let outcome = dispatch(
            &mut state,
            r#"{"type":"response.done","response":{"usage":{"input_token_details":{"audio_tokens":12},"output_token_details":{"audio_tokens":40,"text_tokens":8}}}}"#,
        );
        assert!(matches!(outcome, RouteOutcome::UsageRecorded));
        let counters = state.usage.counters();
        assert_eq!(counters.audio_input_tokens, 12);
        assert_eq!(counters.audio_output_tokens, 40);
        assert_eq!(counters.text_output_tokens, 8);
        assert_eq!(state.ptt.state(), PttState::Idle);
    }

    #[test]
    fn remote_error_is_surfaced_but_empty_commit_is_not() {
        let mut state = SessionState::default();
        let outcome = dispatch(
            &mut state,
            r#"{"type":"error","error":{"code":"invalid_value","message":"nope"}}"#,
        );
        match outcome {
            RouteOutcome::RemoteError(SessionError::ProtocolError { code, message }) => {
                assert_eq!(code.as_deref(), Some("invalid_value"));
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        state.conversation.ensure_ephemeral(EntryStatus::Speaking);
        let outcome = dispatch(
            &mut state,
            r#"{"type":"error","error":{"code":"input_audio_buffer_commit_empty","message":"buffer too small"}}"#,
        );
        assert!(matches!(outcome, RouteOutcome::LogChanged));
        assert!(state.conversation.entries().is_empty());
    }

    #[test]
    fn reply_to_noise_turn_never_reaches_the_log() {
        let mut state = SessionState::default();
        dispatch(&mut state, r#"{"type":"input_audio_buffer.committed","item_id":"u1"}"#);
        dispatch(
            &mut state,
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"u1","transcript":"ご視聴ありがとうございました"}"#,
        );
        let outcome = dispatch(
            &mut state,
            r#"{"type":"response.output_audio_transcript.done","item_id":"a1","transcript":"どういたしまして"}"#,
        );
        assert!(matches!(outcome, RouteOutcome::Ignored));
        dispatch(&mut state, r#"{"type":"response.done","response":{"id":"r1"}}"#);
        assert!(state.conversation.entries().is_empty());
    }

    #[test]
    fn malformed_and_unknown_messages_change_nothing() {
        let mut state = SessionState::default();
        assert!(matches!(dispatch(&mut state, "not json"), RouteOutcome::Ignored));
        assert!(matches!(
            dispatch(&mut state, r#"{"type":"session.created","session":{}}"#),
            RouteOutcome::Ignored
        ));
        assert!(matches!(
            dispatch(&mut state, r#"{"type":"response.audio_transcript.delta","delta":"は"}"#),
            RouteOutcome::Ignored
        ));
        assert!(state.conversation.entries().is_empty());
    }
}
