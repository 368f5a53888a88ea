pub mod can;

mod client;
pub use client::*;

pub mod heatshrink;
pub mod imports;
pub mod package;
pub mod protocol;
pub mod transfer;
