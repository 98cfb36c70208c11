//! Scene object storage for frameline.
//!
//! This crate provides the [`Registry`], a generation-checked arena that owns scene
//! objects and hands out copyable [`Handle`]s.

pub mod registry;

pub use registry::{Handle, Registry};
