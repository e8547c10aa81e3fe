mod handler;
pub mod model;

pub use handler::{list_friends, list_requests, remove_friend, respond_request, send_request};
