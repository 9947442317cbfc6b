pub mod autosave;
pub mod snapshot;
