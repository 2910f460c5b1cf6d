pub mod bookmarks;
pub mod bus_monitor;
pub mod collector;
pub mod config;
pub mod event;
pub mod file_monitor;
pub mod gvariant;
pub mod keyfile;
pub mod paths;
pub mod protocol;
pub mod queue;
pub mod schema;
pub mod sources;
pub mod status;
pub mod transport;
pub mod variant;
