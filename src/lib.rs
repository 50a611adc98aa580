#![forbid(unsafe_code)]

pub mod api;
pub mod blob;
pub mod builder;
pub mod config;
pub mod engine;
pub mod effects;
pub mod error;
pub mod executor;
pub mod model;
pub mod paginate;
pub mod playlists;
pub mod relations;
pub mod social;
pub mod stage;
pub mod store;
pub mod toggle;
pub mod users;
pub mod videos;
pub mod views;

pub use crate::engine::Core;
pub use crate::error::{CoreError, CoreResult};
