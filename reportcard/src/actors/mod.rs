//! Routines and the journal actor.

pub mod agent;
pub mod event_store;
pub mod fanout;
pub mod pipeline;
pub mod poll;

pub use event_store::{EventStoreActor, EventStoreArguments, EventStoreMsg};
