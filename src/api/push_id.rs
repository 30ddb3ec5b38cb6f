//! Purpose: Generate chronologically ordered push keys for store-assigned children.
//! Exports: `PushIdGenerator`.
//! Role: Key source for in-memory pushes; matches the remote store's key shape.
//! Invariants: Keys are 20 chars: 8 timestamp chars then 12 random chars.
//! Invariants: Keys from one generator are strictly increasing, even within a millisecond.
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::error::{ApiResult, Error, ErrorKind};

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

#[derive(Default)]
pub struct PushIdGenerator {
    state: Mutex<PushState>,
}

#[derive(Default)]
struct PushState {
    last_ms: u64,
    last_random: [u8; RANDOM_CHARS],
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ApiResult<String> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("system clock is before unix epoch")
                    .with_source(err)
            })?;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let ms = now_ms.max(state.last_ms);
        if ms == state.last_ms {
            increment(&mut state.last_random);
        } else {
            let mut bytes = [0u8; RANDOM_CHARS];
            getrandom::fill(&mut bytes).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message(format!("failed to read random bytes: {err}"))
            })?;
            for (slot, byte) in state.last_random.iter_mut().zip(bytes) {
                *slot = byte & 0x3f;
            }
            state.last_ms = ms;
        }
        Ok(encode(ms, &state.last_random))
    }
}

fn increment(random: &mut [u8; RANDOM_CHARS]) {
    for slot in random.iter_mut().rev() {
        if *slot == 63 {
            *slot = 0;
        } else {
            *slot += 1;
            return;
        }
    }
}

fn encode(ms: u64, random: &[u8; RANDOM_CHARS]) -> String {
    let mut out = [0u8; TIME_CHARS + RANDOM_CHARS];
    let mut rest = ms;
    for slot in out[..TIME_CHARS].iter_mut().rev() {
        *slot = PUSH_CHARS[(rest % 64) as usize];
        rest /= 64;
    }
    for (slot, value) in out[TIME_CHARS..].iter_mut().zip(random) {
        *slot = PUSH_CHARS[*value as usize];
    }
    out.iter().map(|byte| *byte as char).collect()
}

#[cfg(test)]
mod tests {
    use super::{PUSH_CHARS, PushIdGenerator, encode, increment};

    #[test]
    fn ids_have_expected_shape() {
        let generator = PushIdGenerator::new();
        let id = generator.next_id().expect("id");
        assert_eq!(id.len(), 20);
        assert!(id.bytes().all(|byte| PUSH_CHARS.contains(&byte)));
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = PushIdGenerator::new();
        let mut previous = generator.next_id().expect("id");
        for _ in 0..500 {
            let next = generator.next_id().expect("id");
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn timestamp_prefix_orders_by_time() {
        let random = [0u8; 12];
        assert!(encode(1_000, &random) < encode(1_001, &random));
        assert!(encode(63, &random) < encode(64, &random));
    }

    #[test]
    fn increment_carries() {
        let mut random = [0u8; 12];
        random[11] = 63;
        increment(&mut random);
        assert_eq!(random[10], 1);
        assert_eq!(random[11], 0);
    }
}
