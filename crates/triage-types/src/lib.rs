mod event;
mod message;
mod provider;
mod response;
mod session;
mod tool;

pub use event::*;
pub use message::*;
pub use provider::*;
pub use response::*;
pub use session::*;
pub use tool::*;
