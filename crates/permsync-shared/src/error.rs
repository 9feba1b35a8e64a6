use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Decrypted credential is not valid UTF-8")]
    InvalidUtf8,
}

/// A remote list could not be turned into entries. The whole list is
/// rejected; no entry of a failed parse is ever used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("list is not valid UTF-8")]
    NotUtf8,

    #[error("csv list has no header row")]
    MissingHeader,

    #[error("csv header has no `domain` column")]
    MissingDomainColumn,

    #[error("malformed csv at line {line}: {reason}")]
    Csv { line: u64, reason: String },

    #[error("malformed json list: {0}")]
    Json(String),

    #[error("json entry {index} has no `domain`")]
    MissingDomain { index: usize },
}

/// A string did not name a known enum variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
