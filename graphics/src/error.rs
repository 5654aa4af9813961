//! Error types for the device and frame layer.

use std::fmt;

/// Errors reported by the graphics layer.
///
/// Frame-loop callers are expected to treat every variant except
/// [`GraphicsError::SurfaceLost`] as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Instance or device setup failed.
    InitializationFailed(String),
    /// A buffer, image, pipeline or sync object could not be created.
    ResourceCreationFailed(String),
    /// The selected device lacks a required feature or extension.
    FeatureNotSupported(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// Shader bytecode could not be read or parsed.
    ShaderLoadFailed(String),
    /// The presentable surface was lost and must be recreated.
    SurfaceLost,
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::FeatureNotSupported(msg) => write!(f, "feature not supported: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::ShaderLoadFailed(msg) => write!(f, "shader load failed: {msg}"),
            Self::SurfaceLost => write!(f, "surface lost, needs recreation"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GraphicsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GraphicsError::InitializationFailed("no discrete GPU found".to_string());
        assert_eq!(
            err.to_string(),
            "initialization failed: no discrete GPU found"
        );

        let err = GraphicsError::SurfaceLost;
        assert_eq!(err.to_string(), "surface lost, needs recreation");
    }
}
