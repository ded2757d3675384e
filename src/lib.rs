pub mod buffer;
pub mod config;
pub mod notify;
pub mod promote;
pub mod quality;
pub mod record;
pub mod speed;
pub mod store;
pub mod subscriber;
pub mod transport;
