#[cfg(test)]
#[macro_use]
extern crate lazy_static;

pub mod cli;
pub mod commands;
pub mod computer;
pub mod environment;
pub mod errors;
pub mod interfaces;
pub mod logger;
pub mod objects;
pub mod requests;
pub mod status;
pub mod timeout;
pub mod upload;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;
