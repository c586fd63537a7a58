pub mod authorization;
pub mod controller;
pub mod models;
pub mod settings;
