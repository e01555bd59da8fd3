//! Public entry points: the engine facade and the remote-mining surface.

pub mod engine;
pub mod remote;
