//! End-to-end tests of the code management layer, driven by a fake code
//! generator.

mod common;

mod metadata;
mod registry;
mod tiering;
