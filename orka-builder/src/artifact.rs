use std::fmt;

/// Identifier of the builder that produced an artifact.
pub const BUILDER_ID: &str = "orka";

/// Image produced by a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    image_id: String,
}

impl Artifact {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
        }
    }

    pub fn builder_id(&self) -> &str {
        BUILDER_ID
    }

    /// Image name, or registry reference for pushed images.
    pub fn id(&self) -> &str {
        &self.image_id
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.image_id)
    }
}
