pub mod searchers;
pub mod spec;
