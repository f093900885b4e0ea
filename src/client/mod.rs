pub mod client_controller;
pub mod client_driver;
pub mod client_events;
pub mod command;
