//! Flow reconstruction: packets folded into bidirectional conversations.

mod accumulator;
mod key;
mod record;
mod table;

pub use accumulator::FlowAccumulator;
pub use key::{normalize, Endpoint, FlowKey};
pub use record::{CompletedFlow, EndReason};
pub use table::{FlowTable, Ingested, TableStats};
