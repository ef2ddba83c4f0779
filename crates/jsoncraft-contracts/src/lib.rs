pub mod chat;
pub mod events;
pub mod messages;
pub mod persistence;
pub mod prompt;
pub mod visual;
