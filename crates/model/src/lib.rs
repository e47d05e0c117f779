pub mod backbone;
pub mod classifier;
pub mod config;

pub use backbone::{Backbone, BackboneHandle, FrozenProjection, Identity};
pub use classifier::LinearClassifier;
pub use config::ClassifierConfig;
