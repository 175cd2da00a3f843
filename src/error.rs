//! Error types for the reconstruction library.
//!
//! Every fallible operation in the core returns [`CoreResult`]. The variants
//! map one-to-one to the failure modes a caller can meaningfully react to:
//! I/O errors bubble up unchanged, `Cancelled` is always distinguishable
//! from success, and `InvalidParameters` is a precondition violation that is
//! reported loudly rather than silently patched up.

use std::error::Error as StdError;
use std::fmt;

/// Result alias used throughout the library.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
    /// Decoding or reading the input scan failed.
    LoadFailed { path: String, reason: String },
    /// Writing an output file failed.
    WriteFailed { path: String, source: std::io::Error },
    /// CSP or PTO text could not be parsed.
    ParseError(String),
    /// A large allocation was refused.
    OutOfMemory { what: String, bytes: usize },
    /// Precondition violation (degenerate basis, bad ranges, ...).
    InvalidParameters(String),
    /// The screen detector gave up.
    DetectionFailed(String),
    /// Flood fill found no usable patches.
    NoPatchesFound,
    /// The downhill solver ran out of iterations.
    SolverDidNotConverge,
    /// Too few control points for the requested freedoms.
    InsufficientPoints { needed: usize, got: usize },
    /// No analytic screen tile exists for this screen type.
    UnsupportedScreenType,
    /// Required metadata is absent from the input image.
    MetadataMissing(&'static str),
    /// The supplied ICC profile cannot be used for linearization.
    LinearizeUnsupported(String),
    /// Registration of two stitch tiles disagrees with the grid.
    StitchMismatch {
        tile_a: (usize, usize),
        tile_b: (usize, usize),
        got: (i32, i32),
        expected: (i32, i32),
    },
    /// The progress handle requested cancellation.
    Cancelled,
}

impl CoreError {
    pub fn load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// True when the error is the cooperative-cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::LoadFailed { path, reason } => {
                write!(f, "failed to load '{}': {}", path, reason)
            }
            CoreError::WriteFailed { path, source } => {
                write!(f, "failed to write '{}': {}", path, source)
            }
            CoreError::ParseError(msg) => write!(f, "parse error: {}", msg),
            CoreError::OutOfMemory { what, bytes } => {
                write!(f, "out of memory allocating {} ({} bytes)", what, bytes)
            }
            CoreError::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
            CoreError::DetectionFailed(msg) => write!(f, "screen detection failed: {}", msg),
            CoreError::NoPatchesFound => write!(f, "no screen patches found"),
            CoreError::SolverDidNotConverge => write!(f, "solver did not converge"),
            CoreError::InsufficientPoints { needed, got } => {
                write!(f, "solver needs {} control points, got {}", needed, got)
            }
            CoreError::UnsupportedScreenType => write!(f, "unsupported screen type"),
            CoreError::MetadataMissing(field) => write!(f, "metadata missing: {}", field),
            CoreError::LinearizeUnsupported(profile) => {
                write!(f, "cannot linearize with profile: {}", profile)
            }
            CoreError::StitchMismatch {
                tile_a,
                tile_b,
                got,
                expected,
            } => write!(
                f,
                "stitch mismatch between tile {:?} and {:?}: got shift {:?}, expected {:?}",
                tile_a, tile_b, got, expected
            ),
            CoreError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            CoreError::WriteFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Checked allocation for pixmap-sized buffers: allocator refusal becomes
/// [`CoreError::OutOfMemory`] instead of an abort.
pub fn try_alloc<T: Clone + Default>(len: usize, what: &str) -> CoreResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| CoreError::OutOfMemory {
        what: what.to_string(),
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    v.resize(len, T::default());
    Ok(v)
}
