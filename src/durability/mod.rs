//! Durability tracking: mutation tokens and consistency vectors.

pub mod state;
