//! Integration tests for the storage core.
//!
//! 1. Transaction commit and isolation against shared database state
//! 2. Usage accounting across databases
//! 3. Durability through the persistence manager

pub mod commit_tests;
pub mod helpers;
pub mod persistence_tests;
pub mod usage_tests;
