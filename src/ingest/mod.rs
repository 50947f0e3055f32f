pub mod bridges;
pub mod datex;
pub mod enrich;
pub mod merge;
