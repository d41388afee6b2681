// Synchronized hash map: every operation on one instance is serialized by a
// single mutex, derived operations run caller closures on a detached snapshot

#[macro_use]
extern crate log;

mod map;

pub use crate::map::SyncMap;
