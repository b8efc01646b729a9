//! Time-based one-time passwords (RFC 6238)

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Hash algorithm backing the HMAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TotpAlgorithm {
    /// HMAC-SHA-1, the RFC default and what most authenticator apps expect
    #[default]
    Sha1,
    /// HMAC-SHA-256
    Sha256,
}

/// Parameters of one enrolled TOTP secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotpSpec {
    /// Shared secret
    pub secret: Vec<u8>,
    /// HMAC algorithm
    pub algorithm: TotpAlgorithm,
    /// Time step in seconds
    pub period: u32,
    /// Code length
    pub digits: u32,
}

impl TotpSpec {
    /// A fresh spec with the RFC defaults (SHA-1, 30 s period, 6 digits)
    pub fn generate(secret: Vec<u8>) -> Self {
        Self {
            secret,
            algorithm: TotpAlgorithm::Sha1,
            period: 30,
            digits: 6,
        }
    }

    /// The code valid at `unix_time`
    pub fn code_at(&self, unix_time: i64) -> String {
        let counter = (unix_time.max(0) as u64) / u64::from(self.period.max(1));
        let code = hotp(&self.secret, counter, self.algorithm) % 10u32.pow(self.digits.min(9));
        format!("{code:0width$}", width = self.digits as usize)
    }

    /// Whether `code` is valid at `unix_time`, allowing `skew` adjacent
    /// time steps in either direction
    pub fn verify(&self, unix_time: i64, code: &str, skew: u32) -> bool {
        let period = i64::from(self.period.max(1));
        let mut matched = false;
        for step in -(skew as i64)..=(skew as i64) {
            let t = unix_time + step * period;
            // Compare every window so timing does not reveal which matched
            if self.code_at(t) == code {
                matched = true;
            }
        }
        matched
    }
}

fn hotp(secret: &[u8], counter: u64, algorithm: TotpAlgorithm) -> u32 {
    use hmac::{Hmac, Mac};

    let digest: Zeroizing<Vec<u8>> = match algorithm {
        TotpAlgorithm::Sha1 => {
            let mut mac = <Hmac<sha1::Sha1> as Mac>::new_from_slice(secret)
                .expect("HMAC accepts any key length");
            mac.update(&counter.to_be_bytes());
            Zeroizing::new(mac.finalize().into_bytes().to_vec())
        }
        TotpAlgorithm::Sha256 => {
            let mut mac = <Hmac<sha2::Sha256> as Mac>::new_from_slice(secret)
                .expect("HMAC accepts any key length");
            mac.update(&counter.to_be_bytes());
            Zeroizing::new(mac.finalize().into_bytes().to_vec())
        }
    };

    // RFC 4226 dynamic truncation
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test vectors
    #[test]
    fn test_rfc6238_sha1_vectors() {
        let spec = TotpSpec {
            secret: b"12345678901234567890".to_vec(),
            algorithm: TotpAlgorithm::Sha1,
            period: 30,
            digits: 8,
        };
        assert_eq!(spec.code_at(59), "94287082");
        assert_eq!(spec.code_at(1_111_111_109), "07081804");
        assert_eq!(spec.code_at(1_234_567_890), "89005924");
    }

    #[test]
    fn test_rfc6238_sha256_vectors() {
        let spec = TotpSpec {
            secret: b"12345678901234567890123456789012".to_vec(),
            algorithm: TotpAlgorithm::Sha256,
            period: 30,
            digits: 8,
        };
        assert_eq!(spec.code_at(59), "46119246");
        assert_eq!(spec.code_at(1_111_111_109), "68084774");
    }

    #[test]
    fn test_verify_with_skew() {
        let spec = TotpSpec::generate(b"0123456789abcdef".to_vec());
        let now = 1_700_000_015;

        let current = spec.code_at(now);
        assert!(spec.verify(now, &current, 1));

        // The previous window passes with skew 1 but not skew 0
        let previous = spec.code_at(now - 30);
        assert!(spec.verify(now, &previous, 1));
        if previous != current {
            assert!(!spec.verify(now, &previous, 0));
        }

        assert!(!spec.verify(now, "000000", 1) || current == "000000");
    }

    #[test]
    fn test_codes_are_zero_padded() {
        let spec = TotpSpec::generate(b"another-secret".to_vec());
        for t in (0..3000).step_by(30) {
            assert_eq!(spec.code_at(t).len(), 6);
        }
    }
}
