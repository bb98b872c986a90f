mod chat;
mod core;

pub use self::core::{router, AppState};
