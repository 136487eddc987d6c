pub mod core;
pub mod courses;
pub mod groups;
pub mod import;
pub mod setup;
pub mod users;
