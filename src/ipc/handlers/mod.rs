pub mod attendance;
pub mod catalog;
pub mod core;
pub mod sessions;
