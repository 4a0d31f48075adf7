//! Data Transfer Objects for REST request/response serialization.

pub mod session_dto;

pub use session_dto::*;
