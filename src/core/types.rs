//! Core type aliases and re-exports

pub use glam::{IVec2, Vec2, Vec3};

/// Standard Result type for terrafeed
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;
