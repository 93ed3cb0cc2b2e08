//! Input/output surfaces
//!
//! PLY point-cloud reading, GLB mesh export, JSON artifacts and the binary
//! overlay pack.

pub mod artifacts;
pub mod glb;
pub mod overlay;
pub mod ply;

pub use artifacts::{write_json_pretty, write_landmarks_json};
pub use glb::{encode_glb, write_glb};
pub use overlay::{build_overlay_pack, write_overlay_pack, OverlayPack};
pub use ply::read_ply;
