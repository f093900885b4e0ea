pub mod id_pool;
pub mod server_controller;
pub mod server_driver;
