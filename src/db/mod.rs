//! External database tool integration.

pub mod pg;
