//! Test fixtures

mod mesh;

pub use mesh::{Member, MeshFixture};
