use crate::{Error, Result};
use crc::{CRC_32_ISO_HDLC, Crc};
use log::trace;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Extracts the routable part of a key: the substring between the first
/// `{` and the next `}` when non-empty, else the whole key.
pub fn key_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|b| *b == b'{')
        && let Some(len) = key[open + 1..].iter().position(|b| *b == b'}')
        && len > 0
    {
        return &key[open + 1..open + 1 + len];
    }
    key
}

/// Redis Cluster hash slot of a key: CRC16-CCITT of the tag, low 14 bits.
pub fn hash_slot(key: &[u8]) -> usize {
    (crc16::State::<crc16::XMODEM>::calculate(key_tag(key)) & 0x3fff) as usize
}

/// Pluggable key → shard mapping, used instead of the cluster slot table
/// when cluster mode is disabled or has been demoted by fallback.
pub trait KeyShard: Send + Sync {
    fn shard_by_key(&self, key: &[u8]) -> usize;

    fn name(&self) -> &'static str;

    /// Whether sample keys can be generated per shard for this strategy.
    fn is_generate_keys_enabled(&self) -> bool {
        false
    }
}

/// Routes every key to shard 0. Subscriber clients use this strategy so a
/// channel subscription is not fanned across shards.
pub struct KeyShardZero;

impl KeyShard for KeyShardZero {
    fn shard_by_key(&self, _key: &[u8]) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "KeyShardZero"
    }
}

/// CRC-32 of the tagged substring, modulo the shard count.
pub struct KeyShardCrc32 {
    shards_count: usize,
}

impl KeyShardCrc32 {
    pub fn new(shards_count: usize) -> Self {
        Self {
            shards_count: shards_count.max(1),
        }
    }
}

impl KeyShard for KeyShardCrc32 {
    fn shard_by_key(&self, key: &[u8]) -> usize {
        CRC32.checksum(key_tag(key)) as usize % self.shards_count
    }

    fn name(&self) -> &'static str {
        "KeyShardCrc32"
    }

    fn is_generate_keys_enabled(&self) -> bool {
        true
    }
}

/// Pre-computed sample keys, one per shard, for callers that need to target
/// a specific shard with a keyed command.
pub struct KeysForShards {
    keys: Vec<String>,
}

impl KeysForShards {
    /// Brute-forces short lowercase keys until every shard has one.
    pub fn generate(
        shard_count: usize,
        shard_by_key: impl Fn(&str) -> usize,
        max_len: usize,
    ) -> Result<Self> {
        let mut keys = vec![String::new(); shard_count];
        let mut remaining = shard_count;
        for len in 1..=max_len {
            let mut digits = vec![0u8; len];
            loop {
                let key: String = digits.iter().map(|d| (b'a' + d) as char).collect();
                let shard = shard_by_key(&key);
                if shard < shard_count && keys[shard].is_empty() {
                    trace!("generated key {key} for shard {shard}");
                    keys[shard] = key;
                    remaining -= 1;
                    if remaining == 0 {
                        return Ok(Self { keys });
                    }
                }
                // advance the odometer
                let mut idx = len;
                loop {
                    if idx == 0 {
                        break;
                    }
                    idx -= 1;
                    if digits[idx] < 25 {
                        digits[idx] += 1;
                        break;
                    }
                    digits[idx] = 0;
                }
                if digits.iter().all(|d| *d == 0) {
                    break;
                }
            }
        }
        Err(Error::Client(format!(
            "cannot generate keys for {remaining} of {shard_count} shard(s) with max_len={max_len}"
        )))
    }

    pub fn any_key_for_shard(&self, shard_idx: usize) -> Result<&str> {
        self.keys
            .get(shard_idx)
            .filter(|key| !key.is_empty())
            .map(|key| key.as_str())
            .ok_or_else(|| Error::Client(format!("no key generated for shard {shard_idx}")))
    }
}
