pub mod collector;
pub mod result;
pub mod sortspec;
pub mod visitor;
