//! "Internals" refers to low-level objects that are used to implement the "Resources" objects.

pub mod descriptor_set_layout_builder;
pub mod format;
pub mod resource_allocator;
pub mod transfer_ctx;
pub mod util;
