use rand::RngCore;

/// Where encryption nonces come from. Production code uses [`Random`];
/// [`Fixed`] exists so tests can produce deterministic ciphertext. The source
/// is always an explicit field of the create/open/splice options; there is no
/// process-wide default to swap.
///
/// [`Random`]: NonceSource::Random
/// [`Fixed`]: NonceSource::Fixed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NonceSource {
    #[default]
    Random,
    Fixed(Vec<u8>),
}

impl NonceSource {
    pub fn fixed(seed: impl Into<Vec<u8>>) -> Self {
        NonceSource::Fixed(seed.into())
    }

    /// Returns the next nonce of `len` bytes. A fixed seed shorter than `len`
    /// is right-aligned into a zeroed buffer; a longer one keeps its last
    /// `len` bytes.
    pub fn next(&self, len: usize) -> Vec<u8> {
        match self {
            NonceSource::Random => {
                let mut nonce = vec![0u8; len];
                rand::rng().fill_bytes(&mut nonce);
                nonce
            }
            NonceSource::Fixed(seed) => {
                let mut nonce = vec![0u8; len];
                if seed.len() >= len {
                    nonce.copy_from_slice(&seed[seed.len() - len..]);
                } else {
                    nonce[len - seed.len()..].copy_from_slice(seed);
                }
                nonce
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_has_requested_length() {
        let nonce = NonceSource::Random.next(12);
        assert_eq!(nonce.len(), 12);
    }

    #[test]
    fn fixed_exact_length_is_verbatim() {
        let source = NonceSource::fixed(vec![1, 2, 3, 4]);
        assert_eq!(source.next(4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn fixed_short_seed_is_right_aligned() {
        let source = NonceSource::fixed(vec![0xaa, 0xbb]);
        assert_eq!(source.next(4), vec![0, 0, 0xaa, 0xbb]);
    }

    #[test]
    fn fixed_long_seed_keeps_last_bytes() {
        let source = NonceSource::fixed(vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(source.next(4), vec![3, 4, 5, 6]);
    }

    #[test]
    fn fixed_is_repeatable() {
        let source = NonceSource::fixed(vec![9u8; 12]);
        assert_eq!(source.next(12), source.next(12));
    }
}
