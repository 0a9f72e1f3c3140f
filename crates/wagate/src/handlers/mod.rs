//! HTTP request handlers.

mod connect;
mod health;
mod instances;
mod messages;

pub use connect::connect;
pub use health::{livez, readyz};
pub use instances::{get_instance, list_instances, status};
pub use messages::send_message;
