use thiserror::Error;

/// Fatal conditions: the implementation asked for something impossible and
/// must be fixed. Never raised for a declined/ineligible instruction -- those
/// are represented by [`crate::decode::Eligibility`] instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("encoder refused to materialize {mnemonic}: {reason}")]
    EncoderFailure {
        mnemonic: &'static str,
        reason: String,
    },

    #[error("self-check failed on emitted bytes for {what}: expected {expected}, found {found}")]
    MalformedEncoding {
        what: &'static str,
        expected: String,
        found: String,
    },

    #[error("failed to parse __TEXT,__unwind_info: {0}")]
    UnwindSectionParse(String),

    #[error("failed to locate __TEXT,__unwind_info in module: {0}")]
    UnwindSectionMissing(String),

    #[error("module object parse error: {0}")]
    ObjectParse(#[from] object::read::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config (de)serialization error: {0}")]
    ConfigSerde(#[from] serde_json::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("coverage persistence error: {0}")]
    PersistFormat(String),

    #[error("unknown module: {0}")]
    UnknownModule(String),
}

pub type Result<T> = std::result::Result<T, Error>;
