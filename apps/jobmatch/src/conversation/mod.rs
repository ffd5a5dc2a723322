// Profile-elicitation dialogue: state machine, gateway round-trips, HTTP handlers.

pub mod handlers;
pub mod models;
pub mod orchestrator;

pub use orchestrator::ConversationOrchestrator;
