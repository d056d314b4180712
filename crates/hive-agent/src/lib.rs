pub mod api;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod installer;
pub mod logs;
pub mod port_alloc;
pub mod process_handle;
pub mod query;
pub mod reconcile;
pub mod records;
pub mod scheduler;
pub mod supervisor;
