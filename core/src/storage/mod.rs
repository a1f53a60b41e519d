//! Flow archive and scope persistence

mod flow_store;
mod predicate;
mod scope_settings;

pub use flow_store::{FlowStore, DB_FILE_NAME, DEFAULT_MAX_ROWS};
