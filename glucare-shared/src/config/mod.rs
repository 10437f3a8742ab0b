//! # Configuration
//!
//! Configuration structures for the chat core and its store adapters.

pub mod chat;
