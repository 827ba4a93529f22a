pub mod backend;
pub mod codec;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod names;
pub mod rows;
pub mod session;
pub mod settings;
pub mod value;
pub mod wire;

pub use session::{App, Session};
