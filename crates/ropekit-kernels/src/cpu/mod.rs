//! CPU kernel implementations

pub mod rope;
