//! Consistency checker and tree rebuilder for a journaled, B+-tree
//! structured on-disk filesystem. The CLI in `main.rs` is a thin wrapper
//! over this library; everything that touches the on-disk format lives
//! under [`core`].

pub mod core;
