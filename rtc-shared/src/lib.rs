#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod conn;
pub mod error;
pub mod util;

pub use conn::Conn;
