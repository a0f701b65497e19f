//! Turn-taking and replies
//!
//! The orchestrator decides when to listen and when to speak; the session
//! produces what is said.

mod orchestrator;
mod session;

pub use orchestrator::{
    ConversationEvent, ConversationOrchestrator, ConversationState, DEFAULT_RESUME_DELAY, NotifyingSpeaker,
    SpeechActivity,
};
pub use session::{
    ConversationSession, DEFAULT_HISTORY_LIMIT, Exchange, NEWS_INSTRUCTION, NewsRetriever, Reply, news_context_message,
};
