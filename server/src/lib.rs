pub mod api;
pub mod auth;
pub mod chats;
pub mod config;
pub mod conversations;
pub mod db;
pub mod enrich;
pub mod error;
pub mod subscribe;
pub mod sweep;
pub mod users;
