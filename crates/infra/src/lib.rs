//! Infrastructure layer: job broker, workers, mail, user storage, config.

pub mod config;
pub mod handlers;
pub mod html;
pub mod jobs;
pub mod mail;
pub mod users;
