//! Push-to-talk voice conversation client for a realtime speech endpoint.
//!
//! A [`Session`] fetches an ephemeral credential from the backend, opens the
//! microphone and a transport to the remote endpoint, and keeps an ordered
//! conversation log while the user talks. Stopping releases every resource
//! and debits the session's token usage.

pub mod audio;
pub mod conversation;
pub mod error;
pub mod filter;
pub mod ptt;
pub mod realtime;
pub mod router;
pub mod session;
pub mod settings;
pub mod token;
pub mod usage;

pub use conversation::{ConversationEntry, EntryStatus, Role};
pub use error::{Result, SessionError};
pub use ptt::PttState;
pub use session::{Session, SessionDeps, SessionEvent, SessionSettings};
pub use settings::Settings;
