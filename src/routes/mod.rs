pub mod friend;
pub mod group;
pub mod message;
pub mod trip;
pub mod user;
