mod portal;

pub mod config;

pub use portal::{ClientError, ClientPortal};
