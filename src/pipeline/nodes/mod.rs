// pipeline/nodes/mod.rs — Node catalogue.

pub mod detectors;
pub mod filters;
pub mod images;
pub mod keypoints;
pub mod portals;

pub use detectors::{FastConfig, FastDetector};
pub use filters::Greyscale;
pub use images::{ImageBuffer, ImageMultiplexer, ImagePyramid, ImageSink, ImageSource};
pub use keypoints::{
    KeypointBorderClipper, KeypointBuffer, KeypointClipper, KeypointMixer, KeypointShuffler,
    KeypointSink, KeypointSource,
};
pub use portals::{
    ImagePortal, ImagePortalSink, ImagePortalSource, KeypointPortal, KeypointPortalSink,
    KeypointPortalSource, Portal,
};
