pub mod admin;
pub mod attendance;
pub mod core;
pub mod dashboard;
pub mod delivery;
pub mod notices;
pub mod requests;
pub mod students;
pub mod sync;
pub mod users;
