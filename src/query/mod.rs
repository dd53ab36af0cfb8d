pub mod facade;
pub mod matcher;
pub mod server;

pub use facade::*;
pub use matcher::*;
pub use server::*;
