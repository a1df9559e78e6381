pub mod config;
pub mod ids;
pub mod messages;

pub use config::{ConfigError, ConfigKind, Properties};
pub use ids::SessionId;
pub use messages::{AnswerItem, OutboundQuestion, QuestionKey, QuestionValue, SubmitQuestion};
