//! Small shared type aliases, following the teacher crate's convention of
//! aliasing `rustc_hash::FxHashMap` rather than spelling it out everywhere.

pub type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type FastHashSet<T> = rustc_hash::FxHashSet<T>;
