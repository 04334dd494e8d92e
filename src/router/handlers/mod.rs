//! Docker Engine API v1.51 handlers (spec.md §6), one module per
//! resource family, mirroring the teacher's `handlers::servers`/
//! `handlers::files`/`handlers::backup` split in `router/handlers/mod.rs`.

pub mod containers;
pub mod events;
pub mod exec;
pub mod images;
pub mod networks;
pub mod system;
pub mod volumes;
