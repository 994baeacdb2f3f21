//! Container runtime implementations.
//!
//! Each backend implements [`ContainerRuntime`](crate::runtime::ContainerRuntime)
//! for one container engine. The bridge and lifecycle code only ever see the
//! trait object.

pub mod docker;

pub use self::docker::DockerRuntime;
