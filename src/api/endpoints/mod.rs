pub mod chat;
pub mod health;
pub mod patients;
pub mod sessions;
