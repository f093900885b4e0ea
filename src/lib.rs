pub mod cli;
pub mod client;
pub mod config;
pub mod directory;
pub mod messaging;
pub mod server;
pub mod util;

#[cfg(test)]
pub mod test_util;
#[cfg(test)]
mod scenarios;
