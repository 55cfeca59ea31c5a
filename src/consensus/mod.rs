pub mod client;
pub mod log;
pub mod message;
pub mod peers;
pub mod principal;
pub mod qc;
pub mod replica;
pub mod service;
pub mod store;
pub mod timer;
pub mod types;

pub use client::*;
pub use message::*;
pub use peers::*;
pub use qc::*;
pub use replica::*;
pub use service::*;
pub use store::*;
