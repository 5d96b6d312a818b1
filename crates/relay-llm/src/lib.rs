pub mod echo;
pub mod sse;
pub mod upstream;

pub mod mock;

pub use echo::EchoGenerator;
pub use mock::{ScriptStep, ScriptedGenerator};
pub use upstream::{UpstreamConfig, UpstreamGenerator};
