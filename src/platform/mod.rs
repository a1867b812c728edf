//! Runtime helpers shared by the data store and the realtime router.

pub mod runtime;
