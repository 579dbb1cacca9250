pub mod decoder;
pub mod record;
pub mod topic;

pub use decoder::decode;
pub use record::{RawMessage, RejectReason, RejectedMessage, SensorRecord};
pub use topic::{TopicPattern, TopicPatternError};
