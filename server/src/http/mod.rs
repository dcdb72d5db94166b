mod dto;
mod error;
mod handlers;
mod server;
mod state;


pub use dto::{ErrorResponse, FindKeystoresParams, FindKeystoresResponse, UpdateKeystoreResponse};
pub use error::{ApiError, ApiResult};
pub use server::{build_router, start_server};
pub use state::AppState;
