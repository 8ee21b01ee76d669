// src/lib.rs

//! Fence-synchronised presentation of GPU-rendered frames through DRM/KMS.
//!
//! A [`surface::SurfaceManager`] hands out scanout-capable buffers, a
//! [`render::RenderContext`] fills them, and an [`engine::Engine`] posts
//! them to the display with either atomic or legacy commits.

pub mod config;
pub mod engine;
pub mod error;
pub mod kms;
pub mod render;
pub mod surface;

pub use error::{ErrorClass, PresentError, Result};
