//! Topology: cluster config model, node registry, routing, and the
//! streaming monitor that keeps them current.

pub mod cluster;
pub mod locator;
pub mod monitor;
pub mod registry;
