//! Session id generation.
//!
//! Ids follow the NUID scheme: a random 12-character prefix plus a
//! 10-character monotonic sequence, both base-62, giving 22 opaque bytes.
//! The prefix rotates when the sequence space is exhausted, so ids stay
//! unique for the life of the process without coordination.

use rand::Rng;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
const BASE: u64 = 62;
/// 62^10, the number of sequence values per prefix.
const MAX_SEQ: u64 = 839_299_365_868_340_224;

pub struct SessionIdGenerator {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    step: u64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut gen = SessionIdGenerator {
            prefix: [0; PREFIX_LEN],
            seq: rng.gen_range(0..MAX_SEQ / 2),
            step: rng.gen_range(32..512),
        };
        gen.randomize_prefix();
        gen
    }

    fn randomize_prefix(&mut self) {
        let mut rng = rand::thread_rng();
        for byte in self.prefix.iter_mut() {
            *byte = BASE62[rng.gen_range(0..BASE) as usize];
        }
    }

    /// Produce the next id. Advances the sequence by a random fixed step so
    /// consecutive ids are not guessable from one observation.
    pub fn next_id(&mut self) -> Vec<u8> {
        self.seq += self.step;
        if self.seq >= MAX_SEQ {
            self.randomize_prefix();
            self.seq %= MAX_SEQ;
        }

        let mut id = Vec::with_capacity(PREFIX_LEN + SEQ_LEN);
        id.extend_from_slice(&self.prefix);

        let mut digits = [0u8; SEQ_LEN];
        let mut rem = self.seq;
        for slot in digits.iter_mut().rev() {
            *slot = BASE62[(rem % BASE) as usize];
            rem /= BASE;
        }
        id.extend_from_slice(&digits);

        id
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
