#![warn(rust_2018_idioms)]

pub mod agent;
pub mod control;
pub mod error;
pub mod priority;
pub mod rand;
pub mod state;

pub use agent::{Credentials, IceLiteAgent};
pub use state::IceLiteState;
