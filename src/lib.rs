#![warn(
    rust_2024_compatibility,
    clippy::all,
    clippy::future_not_send,
    clippy::mod_module_files,
    clippy::needless_pass_by_ref_mut,
    clippy::unused_async
)]

pub mod config;
pub mod credentials;
pub mod directory;
pub mod proxy;
pub mod refresh;
pub mod routing;
pub mod secrets;
pub mod upstream;
