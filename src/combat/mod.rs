pub mod engagement;
pub mod procs;
pub mod spells;
pub mod threat;
