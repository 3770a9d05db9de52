pub mod config;
pub mod mesh;

pub use config::Config;
pub use mesh::{MeshEvent, MeshHandle, MeshManager, PeerId};
