pub mod cache;
pub mod layout;
pub mod planner;
pub mod slotfile;
pub mod unique_slots;
pub mod verifier;
pub mod writer;
