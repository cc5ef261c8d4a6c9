//! A source-to-source rewrite of direct 2-D convolutions into cache-blocked,
//! tiled loop nests.
//!
//! The pipeline lowers a named convolution into an explicit reduction over a
//! window-flattened output ([`lowering`]), plans two tiers of tile sizes from
//! an externally supplied cache-blocking strategy ([`planner`]), applies both
//! tiers ([`tiling`]), and, for the input-stationary schedule, interchanges
//! the two innermost loops ([`interchange`]). [`rewrite::rewrite_conv`] runs
//! the whole pipeline over a [`graph::Graph`] and publishes handles to the
//! micro-kernel and every produced loop.

pub mod common;
pub mod expr;
pub mod graph;
pub mod interchange;
#[cfg(feature = "verification")]
pub mod interpret;
pub mod lowering;
pub mod planner;
pub mod pprint;
pub mod rewrite;
pub mod strategy;
pub mod tiling;
