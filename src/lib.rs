pub mod archiver;
pub mod config;
pub mod db;
pub mod error;
pub mod forms;
pub mod handlers;
pub mod middleware;
pub mod porter;
pub mod router;
pub mod service;

pub use archiver::Archiver;
pub use db::EmbarkStorage;
pub use error::EmbarkError;
