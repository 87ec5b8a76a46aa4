//! HTTP API handlers.
//!
//! Defines the Actix routes for adding torrents, streaming their files, and
//! inspecting live sessions.

pub mod add;
pub mod health;
pub mod sessions;
pub mod stream;

pub use add::add_torrent;
pub use health::health_check;
pub use sessions::sessions_list;
pub use stream::stream_file;
