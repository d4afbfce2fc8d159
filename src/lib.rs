pub mod app_state;
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod peer;
pub mod playback;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod track;
pub mod view;
