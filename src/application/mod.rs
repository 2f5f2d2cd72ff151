//! Application services: resolution, rendering and components.

pub mod backends;
pub mod components;
pub mod error;
pub mod render;
pub mod resolver;
