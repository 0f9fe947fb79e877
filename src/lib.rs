// Shashin signed image transformation service
// Origin image handler plus the edge signature gate in front of it

pub mod config;
pub mod edge;
pub mod error;
pub mod handler;
pub mod image_handler;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod request;
pub mod s3;
pub mod secrets;
