//! Queue item types.

pub mod model;

pub use model::{
    ClaimToken, Claimed, Enrichment, Flag, ItemStatus, MessagePayload, NewItem, Priority,
    StatusCounts, SweepReport, TodoItem, WorkItem,
};
