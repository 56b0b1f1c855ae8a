//! Collaborator implementations.
//!
//! This module contains implementations of the traits in [`crate::transport`]
//! that do not require a broker.

pub mod memory;

pub use memory::{
    InMemoryManagementClient, InMemoryReceiverLink, InMemorySenderLink, InMemoryTokenProvider,
    InMemoryTransport,
};
