use thiserror::Error;

/// I/O errors that can occur when reading raw bytes from a dataset
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// The underlying read failed
    #[error("Read error: {0}")]
    Read(String),

    /// Resource not found
    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Errors that can occur when parsing GeoTIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0} (only uncompressed and Deflate are supported)")]
    UnsupportedCompression(String),

    /// Unsupported sample layout
    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// The file carries no usable georeferencing
    #[error("Missing georeference: {0}")]
    MissingGeoreference(String),

    /// A compressed block could not be decoded
    #[error("Failed to decode block {index}: {message}")]
    Decode { index: usize, message: String },
}

/// Errors raised by the raster I/O collaborator
#[derive(Debug, Clone, Error)]
pub enum RasterError {
    /// The dataset could not be opened (missing or corrupt file)
    #[error("Failed to open dataset {handle}: {message}")]
    Open { handle: String, message: String },

    /// A coordinate transformation failed
    #[error("Coordinate transformation failed: {0}")]
    Transform(String),

    /// A read from an open dataset failed
    #[error("Read failed: {0}")]
    Read(String),

    /// The requested window does not fit the dataset or output shape
    #[error("Invalid window: {0}")]
    InvalidWindow(String),
}

impl RasterError {
    /// Wrap a lower-level error with the handle it occurred on.
    pub fn open(handle: impl Into<String>, err: impl std::fmt::Display) -> Self {
        RasterError::Open {
            handle: handle.into(),
            message: err.to_string(),
        }
    }
}

impl From<TiffError> for RasterError {
    fn from(err: TiffError) -> Self {
        RasterError::Read(err.to_string())
    }
}

/// Errors from the execution pool
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// A worker crashed while running a task
    #[error("Worker pool is broken: {0}")]
    Broken(String),

    /// No worker pool could be created
    #[error("Worker pool unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while parsing or evaluating a band-math expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// The expression text is not syntactically valid
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    /// The expression uses a construct outside the allowed grammar
    #[error("Disallowed syntax: {0}")]
    Disallowed(String),

    /// An identifier that is neither an operand nor a constant
    #[error("Unknown name: {0}")]
    UnknownName(String),

    /// A call to a function outside the whitelist
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A whitelisted function called with the wrong number of arguments
    #[error("Function {function} expects {expected} argument(s), got {actual}")]
    Arity {
        function: String,
        expected: usize,
        actual: usize,
    },

    /// Operands with incompatible shapes
    #[error("Shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch((usize, usize), (usize, usize)),

    /// The expression evaluated to a scalar instead of a band
    #[error("Expression does not return an array")]
    ScalarResult,

    /// The evaluation exceeded its wall-clock budget
    #[error("Expression evaluation timed out after {0} ms")]
    Timeout(u128),

    /// The expression nests deeper than the evaluator allows
    #[error("Expression is too complex: {0}")]
    TooComplex(String),

    /// An operation is undefined for its operands
    #[error("Math error: {0}")]
    Math(String),
}

impl ExpressionError {
    /// Message that is safe to show to API callers.
    ///
    /// Internal details stay in logs; callers only learn whether the expression
    /// was rejected or timed out.
    pub fn public_message(&self) -> &'static str {
        match self {
            ExpressionError::Timeout(_) => "expression evaluation timed out",
            _ => "error while evaluating expression",
        }
    }
}

/// Errors from the metadata store collaborator
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No dataset is registered under the given keys
    #[error("No dataset found for keys {0:?}")]
    NotFound(Vec<String>),

    /// Keys do not match the store's key names
    #[error("Invalid keys: {0}")]
    InvalidKeys(String),

    /// The backend failed
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors that can occur while computing dataset statistics
#[derive(Debug, Clone, Error)]
pub enum StatsError {
    /// The dataset contains no valid pixel
    #[error("Raster file {handle} does not contain any valid data")]
    NoValidData { handle: String },

    /// Mutually exclusive options were combined
    #[error("Conflicting options: {0}")]
    ConflictingOptions(String),

    /// Raster collaborator error
    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),
}

/// Errors that can occur during tile generation
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The requested bounds barely intersect the dataset
    #[error("Tile out of bounds: dataset covers {coverage:.4} of the tile (threshold {threshold})")]
    OutOfBounds { coverage: f64, threshold: f64 },

    /// Raster collaborator error
    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    /// The execution pool failed
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Band-math evaluation failed
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// Metadata store failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Statistics computation failed
    #[error("Statistics error: {0}")]
    Stats(#[from] StatsError),

    /// The request parameters are invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Image encoding failed
    #[error("Failed to encode image: {0}")]
    Encode(String),
}

impl TileError {
    /// Whether the caller should substitute a blank tile instead of failing.
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, TileError::OutOfBounds { .. })
    }
}
