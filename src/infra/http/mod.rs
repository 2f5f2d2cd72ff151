mod middleware;
mod public;

pub use middleware::{RequestContext, log_responses, set_request_context};
pub use public::{HttpState, build_router, into_http_response};

pub use crate::cache::CACHE_STATUS_HEADER;

/// Set by htmx on partial page requests; selects fragment mode.
pub const HX_REQUEST_HEADER: &str = "hx-request";
/// Names the block to render; selects block mode.
pub const RENDER_BLOCK_HEADER: &str = "x-render-block";
