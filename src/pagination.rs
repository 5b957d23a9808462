/// Opaque page tokens
///
/// A page token is the URL-safe base64 form of a JSON keyset cursor. Each cursor
/// records the query it was issued for so a token cannot be replayed against a
/// different listing.

use crate::error::{LifecycleError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};

/// Clamp a caller-supplied page size: non-positive means "use the default"
pub fn effective_page_size(requested: i32, default: usize, max: usize) -> usize {
    if requested <= 0 {
        default.clamp(1, max.max(1))
    } else {
        (requested as usize).min(max.max(1))
    }
}

pub fn encode_token<T: Serialize>(cursor: &T) -> Result<String> {
    let json = serde_json::to_vec(cursor)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a token; anything that does not decode is the caller's mistake
pub fn decode_token<T: DeserializeOwned>(token: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|_| LifecycleError::invalid("malformed page_token"))?;
    serde_json::from_slice(&bytes).map_err(|_| LifecycleError::invalid("malformed page_token"))
}
