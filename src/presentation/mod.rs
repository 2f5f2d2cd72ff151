//! HTML produced by the server itself rather than by stored templates.

pub mod views;
