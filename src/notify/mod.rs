//! Observers of node status transitions: a broadcast event stream and the
//! graph-update dispatcher that acknowledges queue messages in batches.

pub mod dispatcher;
pub mod events;

pub use dispatcher::{
    AckSink, GraphUpdateDispatcher, GraphUpdateService, ProgressNotifier, StatusUpdateMessage,
};
pub use events::{StatusEvent, StatusEvents};
