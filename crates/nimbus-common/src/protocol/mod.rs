pub mod command;
pub mod error;
pub mod frame;


pub use command::Command;
pub use error::{NimbusError, Result};
pub use frame::{ReplyFrame, RequestFrame, RequestId, ResultStatus};
