//! Random token source for EPCs and request ids.

use rand::RngCore;

pub const REQUEST_ID_LEN: usize = 20;

pub trait TokenSource: Send + Sync {
    /// `n_bytes` random bytes as uppercase hex.
    fn hex_token(&self, n_bytes: usize) -> String;

    /// Opaque lowercase request id of [`REQUEST_ID_LEN`] chars.
    fn request_id(&self) -> String {
        self.hex_token(REQUEST_ID_LEN / 2).to_lowercase()
    }
}

/// Thread-local CSPRNG backed tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn hex_token(&self, n_bytes: usize) -> String {
        let mut bytes = vec![0u8; n_bytes];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode_upper(bytes)
    }
}

/// Build a 24-hex-char (96-bit) EPC from `prefix` plus random hex.
pub fn generate_epc(tokens: &dyn TokenSource, prefix: &str) -> String {
    let remaining = 24usize.saturating_sub(prefix.len());
    let mut epc = format!("{}{}", prefix, tokens.hex_token(remaining.div_ceil(2)));
    epc.truncate(24);
    epc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = RandomTokens.request_id();
        assert_eq!(id.len(), REQUEST_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generated_epc_keeps_prefix() {
        let epc = generate_epc(&RandomTokens, "5A42");
        assert_eq!(epc.len(), 24);
        assert!(epc.starts_with("5A42"));
        assert_ne!(epc, generate_epc(&RandomTokens, "5A42"));
    }

    #[test]
    fn test_generated_epc_without_prefix() {
        assert_eq!(generate_epc(&RandomTokens, "").len(), 24);
    }
}
