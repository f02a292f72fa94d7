//! Sortable, collision-resistant identifiers
//!
//! # Layout (11 bytes)
//!
//! ```text
//! ┌────────────────────┬──────────────┬──────────────────────────┐
//! │ seconds since      │ per-second   │ OS randomness            │
//! │ EPOCH_OFFSET (BE)  │ counter (BE) │                          │
//! │ 4 bytes            │ 2 bytes      │ 5 bytes                  │
//! └────────────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Encoded as unpadded base32hex (`0-9A-V`), whose character order matches
//! bit order, so comparing the text compares the bytes. The display form
//! splits the 18 characters 7/11 with a dash.
//!
//! # Ordering
//!
//! A single [`IdGenerator`] hands out strictly increasing identifiers: within
//! one second the counter increases, and a new second resets it to zero.
//! The counter is 16 bits and wraps silently past 65 535 identifiers in one
//! second; past that rate ordering within the second is no longer guaranteed.

use crate::clock::Clock;
use chrono::{DateTime, TimeZone, Utc};
use data_encoding::BASE32HEX_NOPAD;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Raw identifier length in bytes
pub const ID_LEN: usize = 11;

/// Encoded length without the dash
pub const ENCODED_LEN: usize = 18;

/// Encoded length with the dash
pub const DASHED_LEN: usize = ENCODED_LEN + 1;

/// Unix seconds of the identifier epoch (2020-01-01T05:00:00Z)
pub const EPOCH_OFFSET_SECS: i64 = 1_577_854_800;

const DASH_AT: usize = 7;

/// Identifier errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Wrong length, wrong characters, misplaced dash
    #[error("malformed identifier: {0}")]
    Malformed(String),

    /// All-zero identifier
    #[error("nil identifier")]
    Nil,

    /// Embedded timestamp is ahead of the validating clock
    #[error("identifier timestamp {embedded} is in the future (now {now})")]
    FromFuture {
        /// Seconds since epoch carried by the identifier
        embedded: u32,
        /// Validator's current seconds since epoch
        now: u32,
    },

    /// OS randomness unavailable
    #[error("entropy source failed: {0}")]
    Entropy(String),
}

/// 11-byte sortable identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier([u8; ID_LEN]);

impl Identifier {
    /// Wrap raw bytes
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice of exactly [`ID_LEN`] bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let raw: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            IdError::Malformed(format!("expected {} bytes, got {}", ID_LEN, bytes.len()))
        })?;
        Ok(Self(raw))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Seconds since [`EPOCH_OFFSET_SECS`]
    pub fn seconds(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Per-second counter
    pub fn counter(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    /// Embedded creation second as a wall-clock instant
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(EPOCH_OFFSET_SECS + i64::from(self.seconds()), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Parse the 18-character or dashed 19-character form (case-insensitive)
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let bytes = s.as_bytes();
        let mut chars = [0u8; ENCODED_LEN];
        match bytes.len() {
            ENCODED_LEN => chars.copy_from_slice(bytes),
            DASHED_LEN => {
                if bytes[DASH_AT] != b'-' {
                    return Err(IdError::Malformed(format!(
                        "expected '-' at position {}",
                        DASH_AT
                    )));
                }
                chars[..DASH_AT].copy_from_slice(&bytes[..DASH_AT]);
                chars[DASH_AT..].copy_from_slice(&bytes[DASH_AT + 1..]);
            }
            len => {
                return Err(IdError::Malformed(format!(
                    "must be {} or {} characters, got {}",
                    ENCODED_LEN, DASHED_LEN, len
                )))
            }
        }
        decode(&mut chars).map(Self)
    }

    /// Reject the nil identifier and identifiers minted after `now`
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), IdError> {
        if self.0 == [0u8; ID_LEN] {
            return Err(IdError::Nil);
        }
        let now = seconds_since_epoch(now);
        if self.seconds() > now {
            return Err(IdError::FromFuture {
                embedded: self.seconds(),
                now,
            });
        }
        Ok(())
    }

    /// Parse then [`validate`](Self::validate) against `clock`
    pub fn parse_validated(s: &str, clock: &dyn Clock) -> Result<Self, IdError> {
        let id = Self::parse(s)?;
        id.validate(clock.now())?;
        Ok(id)
    }

    fn encoded(&self) -> [u8; DASHED_LEN] {
        let chars = encode(&self.0);
        let mut out = [b'-'; DASHED_LEN];
        out[..DASH_AT].copy_from_slice(&chars[..DASH_AT]);
        out[DASH_AT + 1..].copy_from_slice(&chars[DASH_AT..]);
        out
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encoded();
        // alphabet and dash are ASCII
        f.write_str(std::str::from_utf8(&encoded).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

impl FromStr for Identifier {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identifier::parse(&s).map_err(de::Error::custom)
    }
}

fn encode(bytes: &[u8; ID_LEN]) -> [u8; ENCODED_LEN] {
    let mut out = [0u8; ENCODED_LEN];
    BASE32HEX_NOPAD.encode_mut(bytes, &mut out);
    out
}

fn decode(chars: &mut [u8; ENCODED_LEN]) -> Result<[u8; ID_LEN], IdError> {
    chars.make_ascii_uppercase();
    let mut out = [0u8; ID_LEN];
    // Trailing bits of the last symbol must be zero
    BASE32HEX_NOPAD
        .decode_mut(chars, &mut out)
        .map_err(|partial| IdError::Malformed(partial.error.to_string()))?;
    Ok(out)
}

/// Whole seconds since [`EPOCH_OFFSET_SECS`], clamped into `u32`
pub fn seconds_since_epoch(instant: DateTime<Utc>) -> u32 {
    let secs = instant.timestamp() - EPOCH_OFFSET_SECS;
    u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
}

#[derive(Debug, Default)]
struct CounterState {
    last_second: Option<u32>,
    counter: u16,
    /// Latest instant handed out with an identifier
    high_water: Option<DateTime<Utc>>,
}

/// Identifier generator
///
/// Construct once and share by reference. The clock is read under the lock
/// so that concurrent callers cannot pair a stale second with a fresh counter.
#[derive(Debug)]
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    state: Mutex<CounterState>,
}

impl IdGenerator {
    /// Create a generator reading `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(CounterState::default()),
        }
    }

    /// Clock backing this generator
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Next identifier
    ///
    /// Fails only when the OS entropy source does.
    pub fn generate(&self) -> Result<Identifier, IdError> {
        self.issue().map(|(id, _)| id)
    }

    /// Next identifier together with the instant it was issued at
    ///
    /// The instant never goes backwards across calls, even when the clock
    /// does, so rows stamped with it sort the same way by time as by
    /// identifier.
    pub fn issue(&self) -> Result<(Identifier, DateTime<Utc>), IdError> {
        let mut bytes = [0u8; ID_LEN];

        let (second, counter, issued_at) = {
            let mut state = self.state.lock();
            let clock_now = self.clock.now();
            let now = seconds_since_epoch(clock_now);
            let second = match state.last_second {
                Some(last) if now < last => {
                    tracing::warn!(
                        last_second = last,
                        clock_second = now,
                        "Clock moved backwards, holding identifier second"
                    );
                    last
                }
                Some(last) if now == last => last,
                _ => {
                    state.last_second = Some(now);
                    state.counter = 0;
                    now
                }
            };
            let counter = state.counter;
            state.counter = state.counter.wrapping_add(1);

            let issued_at = match state.high_water {
                Some(high_water) if high_water > clock_now => high_water,
                _ => clock_now,
            };
            state.high_water = Some(issued_at);
            (second, counter, issued_at)
        };

        bytes[..4].copy_from_slice(&second.to_be_bytes());
        bytes[4..6].copy_from_slice(&counter.to_be_bytes());
        OsRng
            .try_fill_bytes(&mut bytes[6..])
            .map_err(|e| IdError::Entropy(e.to_string()))?;

        Ok((Identifier(bytes), issued_at))
    }
}
