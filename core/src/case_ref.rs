//! Case reference generation.
//!
//! Case references are externally visible, so they must not reveal how many
//! cases exist or be guessable from one another. A monotonically increasing
//! sequence number is pushed through a keyed Feistel permutation (FE1 style)
//! and offset into the reference range.
//!
//! The census range `[10_000_000, 99_999_999)` holds 89,999,999 values. That
//! count is prime, so the network runs over the factorable domain
//! `N = 9_600 * 9_375 = 90_000_000` and cycle-walks any output that lands
//! outside the target range. Because every round is a bijection on `[0, N)`,
//! walking the cycle from an in-range input always returns to the range, and
//! the composed mapping is a bijection on `[0, range)`.
//!
//! Each round splits `X` into `L = X / b` and `R = X % b`, then produces
//! `X' = a * R + ((L + F(round, R)) mod a)`, where `F` is HMAC-SHA256 over a
//! domain salt, the round number and `R`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Smallest census case reference.
pub const CASE_REF_MIN: i64 = 10_000_000;

/// Number of census case references.
pub const CASE_REF_RANGE: u64 = 89_999_999;

/// Larger factor of the census Feistel domain.
pub const CENSUS_FACTOR_A: u64 = 9_600;

/// Smaller factor of the census Feistel domain.
pub const CENSUS_FACTOR_B: u64 = 9_375;

const ROUNDS: u32 = 3;

const DEFAULT_TWEAK: &[u8] = b"census-rm-case-ref";

/// Errors from case reference generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaseRefError {
    /// The HMAC key must not be empty
    #[error("Case reference secret must not be empty")]
    EmptySecret,

    /// Factors do not describe a usable domain
    #[error("Invalid Feistel domain: range {range}, factors {a} x {b}")]
    InvalidDomain {
        /// Target range size
        range: u64,
        /// Larger factor
        a: u64,
        /// Smaller factor
        b: u64,
    },

    /// Sequence number exceeds the number of available references
    #[error("Sequence number {sequence} outside [0, {range})")]
    SequenceOutOfRange {
        /// Offending sequence number
        sequence: u64,
        /// Target range size
        range: u64,
    },

    /// Case reference is not one this generator could have produced
    #[error("Case reference {0} outside the generator's range")]
    CaseRefOutOfRange(i64),
}

/// The integer domain a permutation runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeistelDomain {
    range: u64,
    a: u64,
    b: u64,
}

impl FeistelDomain {
    /// The census reference domain.
    pub const CENSUS: Self = Self {
        range: CASE_REF_RANGE,
        a: CENSUS_FACTOR_A,
        b: CENSUS_FACTOR_B,
    };

    /// Domain with explicit factors.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::InvalidDomain`] unless `a >= b >= 1` and
    /// `a * b >= range >= 1`.
    pub fn new(range: u64, a: u64, b: u64) -> Result<Self, CaseRefError> {
        let covers = a.checked_mul(b).is_some_and(|n| n >= range);
        if range == 0 || b == 0 || a < b || !covers {
            return Err(CaseRefError::InvalidDomain { range, a, b });
        }
        Ok(Self { range, a, b })
    }

    /// Domain over `[0, range)` with factors chosen near the square root.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::InvalidDomain`] for an empty range.
    pub fn for_range(range: u64) -> Result<Self, CaseRefError> {
        let b = range.isqrt().max(1);
        let a = range.div_ceil(b).max(b);
        Self::new(range, a, b)
    }

    /// Size of the target range.
    #[must_use]
    pub const fn range(&self) -> u64 {
        self.range
    }

    /// Size of the factored domain the rounds operate on.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.a * self.b
    }
}

/// Keyed bijection from sequence numbers to case references.
#[derive(Clone)]
pub struct CaseRefGenerator {
    mac: HmacSha256,
    domain: FeistelDomain,
    offset: i64,
}

impl std::fmt::Debug for CaseRefGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaseRefGenerator")
            .field("domain", &self.domain)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl CaseRefGenerator {
    /// Generator for census case references.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::EmptySecret`] if the secret is empty.
    pub fn new(secret: &[u8]) -> Result<Self, CaseRefError> {
        Self::with_domain(secret, FeistelDomain::CENSUS, CASE_REF_MIN)
    }

    /// Generator over an arbitrary domain, offset by `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::EmptySecret`] if the secret is empty.
    pub fn with_domain(
        secret: &[u8],
        domain: FeistelDomain,
        offset: i64,
    ) -> Result<Self, CaseRefError> {
        if secret.is_empty() {
            return Err(CaseRefError::EmptySecret);
        }
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| CaseRefError::EmptySecret)?;

        let mut salt = Sha256::new();
        salt.update(domain.size().to_be_bytes());
        salt.update(DEFAULT_TWEAK);
        mac.update(&salt.finalize());

        Ok(Self {
            mac,
            domain,
            offset,
        })
    }

    /// Domain this generator permutes.
    #[must_use]
    pub const fn domain(&self) -> FeistelDomain {
        self.domain
    }

    /// Case reference for a sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::SequenceOutOfRange`] if the sequence number
    /// exceeds the number of available references.
    pub fn case_ref(&self, sequence: u64) -> Result<i64, CaseRefError> {
        let permuted = self.permute(sequence)?;
        i64::try_from(permuted)
            .ok()
            .and_then(|p| p.checked_add(self.offset))
            .ok_or(CaseRefError::SequenceOutOfRange {
                sequence,
                range: self.domain.range,
            })
    }

    /// Sequence number a case reference was generated from.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::CaseRefOutOfRange`] for references outside the
    /// generator's range.
    pub fn sequence_for(&self, case_ref: i64) -> Result<u64, CaseRefError> {
        let value = case_ref
            .checked_sub(self.offset)
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v < self.domain.range)
            .ok_or(CaseRefError::CaseRefOutOfRange(case_ref))?;
        let mut x = value;
        loop {
            x = self.decrypt(x);
            if x < self.domain.range {
                return Ok(x);
            }
        }
    }

    /// Apply the permutation to a value in `[0, range)`.
    ///
    /// # Errors
    ///
    /// Returns [`CaseRefError::SequenceOutOfRange`] for values outside the range.
    pub fn permute(&self, value: u64) -> Result<u64, CaseRefError> {
        if value >= self.domain.range {
            return Err(CaseRefError::SequenceOutOfRange {
                sequence: value,
                range: self.domain.range,
            });
        }
        let mut x = value;
        loop {
            x = self.encrypt(x);
            if x < self.domain.range {
                return Ok(x);
            }
        }
    }

    fn encrypt(&self, mut x: u64) -> u64 {
        let FeistelDomain { a, b, .. } = self.domain;
        for round in 0..ROUNDS {
            let left = x / b;
            let right = x % b;
            let w = (left + self.round_function(round, right)) % a;
            x = a * right + w;
        }
        x
    }

    fn decrypt(&self, mut x: u64) -> u64 {
        let FeistelDomain { a, b, .. } = self.domain;
        for round in (0..ROUNDS).rev() {
            let right = x / a;
            let w = x % a;
            let left = (w + a - self.round_function(round, right)) % a;
            x = left * b + right;
        }
        x
    }

    fn round_function(&self, round: u32, right: u64) -> u64 {
        let mut mac = self.mac.clone();
        mac.update(&round.to_be_bytes());
        mac.update(&right.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) % self.domain.a
    }
}
