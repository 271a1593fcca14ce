//! HTTP handlers. Storage and permission logic lives in `services`; these
//! only translate between HTTP and service calls.

pub mod caller;
pub mod file_handlers;
pub mod health_handlers;
