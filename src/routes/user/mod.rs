mod handler;
pub mod model;

pub use handler::{login, logout, me, refresh_token, register, search, update_picture};
