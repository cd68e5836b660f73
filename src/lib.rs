//! Single-writer document collaboration: a soft lock with heartbeat and
//! forced takeover, a live content broadcast for spectators, and autosave
//! gated on the lock. The `script-collab` binary hosts the relay side.

pub mod clients;
pub mod clock;
pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod session;
pub mod state;
pub mod websocket;
pub mod ws;

mod utils;

pub use error::CollabError;
pub use session::{Collaborators, EditorSession, SessionSettings};
