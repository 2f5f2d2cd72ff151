//! Domain layer types and invariants.

pub mod component;
pub mod context;
pub mod template;

pub use component::{
    ComponentDescriptor, ComponentStatus, PropSpec, PropType, SourcePosition, ValidationResult,
};
pub use context::{RenderContext, RenderMode};
pub use template::{Fingerprint, TemplateId, TemplateSource, Tier};
