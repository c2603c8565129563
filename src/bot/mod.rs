//! 操作员交互层：会话状态机与会话表

mod engine;
mod session;

pub use engine::RelayEngine;
pub use session::{Draft, Session, SessionManager, SessionPolicy, Step};
