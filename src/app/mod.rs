//! Map/reduce applications bundled with the crate.

pub mod wc;
