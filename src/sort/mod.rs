//! Back-to-front depth sorting

pub mod radix;
pub mod worker;

pub use radix::{ordering_capacity, sort16, sort32, sort32_with, Sort32Buffers, ORDERING_ROW};
pub use worker::{SortRequest, SortResult, SortWorker};
