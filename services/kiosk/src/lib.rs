pub mod config;
pub mod face_adapter;
pub mod prompt_loader;
pub mod speech_adapter;
pub mod sqlite_store;
pub mod transport;
