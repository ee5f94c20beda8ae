//! The rendering core beneath the scene API.
//!
//! Four layers, leaves first:
//! * the tag database (the `ember-db` crate) pages every heavy object
//!   behind opaque tags,
//! * the node system carries typed, linkable parameters and the shader
//!   system memoizes whole graph invocations per ray,
//! * the ray-traceable scene pairs a top-level BSP over tessellation
//!   bounds with deferred per-tessellation sub-trees,
//! * the bucket pipeline drives adaptive sampling into tiled
//!   framebuffers, with the irradiance cache and the photon map
//!   answering indirect illumination queries.
//!
//! Everything heavier than a ray state lives behind a database tag, so
//! scenes larger than memory page in and out as traversal touches
//! them.

pub mod api;
pub mod camera;
pub mod error;
pub mod fg;
pub mod framebuffer;
pub mod illum;
pub mod job;
pub mod light;
pub mod map;
pub mod material;
pub mod math;
pub mod nodesys;
pub mod obj;
pub mod options;
pub mod photon;
pub mod rt;
pub mod rtypes;
pub mod sampler;
pub mod shader;
pub mod state;
pub mod texture;
pub mod tls;

pub use crate::api::{InstanceDef, RenderContext, RenderOutput};
pub use crate::error::{Error, Result};
pub use crate::math::{BBox, Mat4, Vec2, Vec3, Vec4};
pub use crate::nodesys::{NodeObject, NodeSystem, StorageClass};
pub use crate::options::Options;
pub use crate::state::{RayType, SampleInfo, State};
pub use ember_db::{Database, Tag, Value, ValueType};
