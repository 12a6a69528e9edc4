//! Domain services: the transfer pipeline and everything it is built from.

pub mod buffer_pool;
pub mod carrier;
pub mod chunk_splitter;
pub mod metadata_store;
pub mod pipeline_service;
pub mod session_service;
pub mod transfer_client;
