//! Library indexing: catalog sources, the in-memory media index and the
//! manager that owns it.

pub mod catalog;
pub mod library_manager;
pub mod media_index;
pub mod model;
