//! The API layer, containing web handlers and routing.

pub mod admin;
pub mod handlers;
pub mod router;

pub use admin::{ADMIN_TOKEN_HEADER, get_fee_schedule_handler, replace_fee_schedule_handler};
pub use handlers::ApiDoc;
pub use router::{RateLimitConfig, create_router, create_router_with_rate_limit};
