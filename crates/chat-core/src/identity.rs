//! Display-name rules and anonymous identity allocation.
//!
//! Every connection starts out with an auto-generated anonymous identity of
//! the form `anonymous` + 10 random characters from `[0-9a-zA-Z]`. Users may
//! later pick a name of their own (2 to 12 ASCII letters). Since chosen names
//! can never contain digits or exceed 12 characters, the two spaces cannot
//! collide and an identity's anonymity can be recovered from the string alone.

use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;

/// Literal prefix of generated identities, also the reserved keyword users
/// may not claim as a name.
pub const ANONYMOUS: &str = "anonymous";

/// Number of random characters appended to [`ANONYMOUS`].
pub const SUFFIX_LEN: usize = 10;

/// Default retry bound for [`IdentityAllocator::allocate`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 64;

const MIN_NAME_LEN: usize = 2;
const MAX_NAME_LEN: usize = 12;

/// Errors raised while allocating an identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Every candidate collided with a registered identity.
    #[error("no unique anonymous identity after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Return `true` if `identity` is an auto-generated anonymous identity.
pub fn is_anonymous(identity: &str) -> bool {
    identity.len() == ANONYMOUS.len() + SUFFIX_LEN
        && identity
            .strip_prefix(ANONYMOUS)
            .is_some_and(|suffix| suffix.bytes().all(|b| b.is_ascii_alphanumeric()))
}

/// Name shown to other users: the keyword for anonymous identities, the
/// identity itself otherwise.
pub fn display_name(identity: &str) -> &str {
    if is_anonymous(identity) {
        ANONYMOUS
    } else {
        identity
    }
}

/// Return `true` if `name` is acceptable as a user-chosen identity.
pub fn is_valid_username(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Generates unique anonymous identities with a bounded number of retries.
#[derive(Debug, Clone, Copy)]
pub struct IdentityAllocator {
    max_attempts: u32,
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl IdentityAllocator {
    /// Create an allocator giving up after `max_attempts` collisions.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Return the first candidate for which `taken` reports `false`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Exhausted`] when every attempt collided.
    pub fn allocate(&self, taken: impl FnMut(&str) -> bool) -> Result<String, IdentityError> {
        self.allocate_with(&mut rand::thread_rng(), taken)
    }

    /// Same as [`allocate`](Self::allocate) with an explicit random source.
    pub fn allocate_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        mut taken: impl FnMut(&str) -> bool,
    ) -> Result<String, IdentityError> {
        for _ in 0..self.max_attempts {
            let candidate = candidate(rng);
            if !taken(&candidate) {
                return Ok(candidate);
            }
        }
        Err(IdentityError::Exhausted {
            attempts: self.max_attempts,
        })
    }
}

fn candidate<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut name = String::with_capacity(ANONYMOUS.len() + SUFFIX_LEN);
    name.push_str(ANONYMOUS);
    name.extend(rng.sample_iter(&Alphanumeric).take(SUFFIX_LEN).map(char::from));
    name
}
