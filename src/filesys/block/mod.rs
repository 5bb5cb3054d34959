//! Block device collaborators

pub mod memory;
