pub mod cursor;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod state;
pub mod stream;

pub use cursor::ResumeCursor;
pub use errors::GenerationError;
pub use events::{ErrorDescriptor, Event, EventKind, FinishReason, Payload};
pub use ids::SessionId;
pub use provider::TextGenerator;
pub use state::SessionState;
