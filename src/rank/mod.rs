pub mod match_data;
pub mod processor;
pub mod program;
