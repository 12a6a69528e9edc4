pub mod api_handlers;
pub mod auth_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod share_handlers;
