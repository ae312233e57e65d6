//! rollcall-store — SQLite persistence for the face gallery.
//!
//! Identities, their face embeddings, and the recognition audit log live in
//! one SQLite file accessed through `tokio-rusqlite`.

pub mod codec;
pub mod sqlite;

pub use codec::CodecError;
pub use sqlite::SqliteStore;
