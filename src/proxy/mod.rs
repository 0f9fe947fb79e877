// Proxy module - Pingora ProxyHttp implementations
// The origin service runs the image handler; the edge service verifies
// signatures in front of it.

pub mod edge;
pub mod helpers;
pub mod origin;
pub mod special_endpoints;

pub use edge::EdgeProxy;
pub use origin::{build_image_handler, OriginService};
