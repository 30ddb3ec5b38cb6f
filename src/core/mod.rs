// Core modules implementing addressing, the query pipeline, events, and error modeling.
pub mod error;
pub mod event;
pub mod path;
pub mod query;
pub mod record;
pub mod value;
