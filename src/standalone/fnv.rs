use std::hash::Hasher;

use crate::config::HashMethod;

const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME_TW: u32 = (FNV_64_PRIME & 0x0000_ffff) as u32;
const FNV_32_PRIME: u32 = 16_777_619;
const FNV_32_OFFSET: u32 = 2_166_136_261;

/// The 32-bit truncated fnv1a variant used by twemproxy style rings.
pub struct Fnv1a64(u64);

impl Hasher for Fnv1a64 {
    fn write(&mut self, data: &[u8]) {
        let mut val = self.0 as u32;
        for b in data {
            val ^= u32::from(*b);
            val = val.wrapping_mul(FNV_64_PRIME_TW);
        }
        self.0 = u64::from(val);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

impl Default for Fnv1a64 {
    fn default() -> Fnv1a64 {
        Fnv1a64(FNV_64_OFFSET)
    }
}

pub fn fnv1a64(data: &[u8]) -> u32 {
    let mut hasher = Fnv1a64::default();
    hasher.write(data);
    hasher.finish() as u32
}

pub fn fnv164(data: &[u8]) -> u32 {
    let mut hash = FNV_64_OFFSET;
    for b in data {
        hash = hash.wrapping_mul(FNV_64_PRIME);
        hash ^= u64::from(*b);
    }
    hash as u32
}

pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash = FNV_32_OFFSET;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}

pub fn fnv132(data: &[u8]) -> u32 {
    let mut hash = FNV_32_OFFSET;
    for b in data {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= u32::from(*b);
    }
    hash
}

/// Key hash selected by `hash_method`.
pub fn hash_with(method: HashMethod, data: &[u8]) -> u32 {
    match method {
        HashMethod::Fnv1a64 => fnv1a64(data),
        HashMethod::Fnv164 => fnv164(data),
        HashMethod::Fnv1a32 => fnv1a32(data),
        HashMethod::Fnv132 => fnv132(data),
    }
}
