
mod assembly;
mod nodal;
mod reductions;
