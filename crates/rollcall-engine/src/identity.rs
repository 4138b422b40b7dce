use crate::error::EngineError;

pub const MAX_IDENTITY_LEN: usize = 128;

/// Identities double as artifact file stems, so anything that could escape
/// the artifact directory or garble a file name is refused.
pub fn validate_identity(identity: &str) -> Result<(), EngineError> {
    let reason = if identity.trim().is_empty() {
        Some("must not be empty")
    } else if identity.len() > MAX_IDENTITY_LEN {
        Some("longer than 128 bytes")
    } else if identity == "." || identity == ".." {
        Some("reserved path component")
    } else if identity.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if identity.chars().any(char::is_control) {
        Some("contains a control character")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(EngineError::InvalidIdentity {
            identity: identity.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
