use thiserror::Error;

/// Failure while decoding an envelope or a typed text value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed XML at offset {offset}: {message}")]
    Malformed { message: String, offset: u64 },

    #[error("unrepresentable value `{text}` for xsd:{xsd_type}")]
    Numeric { text: String, xsd_type: String },

    #[error("unexpected envelope structure: {0}")]
    Envelope(String),
}

impl DecodeError {
    pub fn malformed(message: impl Into<String>, offset: u64) -> Self {
        DecodeError::Malformed {
            message: message.into(),
            offset,
        }
    }

    pub fn numeric(text: impl Into<String>, xsd_type: impl Into<String>) -> Self {
        DecodeError::Numeric {
            text: text.into(),
            xsd_type: xsd_type.into(),
        }
    }

    pub fn envelope(message: impl Into<String>) -> Self {
        DecodeError::Envelope(message.into())
    }
}

/// Failure while writing an envelope. Writing to an in-memory buffer cannot
/// fail in practice, but the XML writer surface is fallible.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("XML write error: {0}")]
    Write(#[from] quick_xml::Error),
}
