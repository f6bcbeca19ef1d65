//! WIM archive introspection.
//!
//! This module provides read-only access to image archives:
//! - `Container` - An open archive; enumerates and caches its images
//! - `Image` - One image, with lazily parsed metadata
//! - `ImageMetadata` - Typed accessors with fallbacks over an image document
//! - `MetadataDocument` - Parsed XML metadata with path lookup
//! - Message callbacks (`ImageMessage`, `MessageStatus`, `dispatch`)

mod callback;
mod container;
mod image;
mod info;
mod metadata;

pub use callback::{
    ImageMessage, MessageCallback, MessageKind, MessageStatus, dispatch, is_registered,
};
pub use container::Container;
pub use image::Image;
pub use info::{Architecture, ImageMetadata, ImageVersion};
pub use metadata::{Element, MetadataDocument};
