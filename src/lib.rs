pub mod api;
pub mod config;
pub mod cursor;
pub mod db;
pub mod model;
pub mod source;
pub mod sync;
