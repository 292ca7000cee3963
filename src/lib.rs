pub mod assembly;
pub mod loops;
pub mod materials;
pub mod mesh;
pub mod physics;
pub mod problem;
pub mod system;
pub mod warehouse;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Index of the pool worker executing a range, dense in `0 .. pool width`.
///
/// Loop bodies receive it when they enter a range and use it to tag
/// per-worker scratch and diagnostics. Serial traversals use worker 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ThreadId(pub usize);
