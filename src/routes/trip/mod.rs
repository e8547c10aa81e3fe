mod handler;
pub mod model;

pub use handler::{create_trip, list_trips, update_trip};
