//! Placement map for virtual devices
//!
//! A decoded hierarchical rule set plus bucket tree, loaded once from the
//! file named by the `placement-map` defaults key and consulted read-only by
//! virtual devices. Selection is deterministic: the draw for each candidate
//! is an xxh3 hash of (pool, object, item, attempt) scaled by the item
//! weight, so the same input always yields the same target set.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Magic number at the start of a serialized map ("CRUS")
pub const MAP_MAGIC: u32 = 0x4352_5553;

/// Supported map format version
pub const MAP_VERSION: u8 = 1;

/// Map decoding and selection errors
#[derive(Debug, Error)]
pub enum MapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad map magic: 0x{0:08X}")]
    BadMagic(u32),

    #[error("unsupported map version: {0}")]
    BadVersion(u8),

    #[error("map data truncated")]
    Truncated,

    #[error("unknown bucket algorithm: {0}")]
    UnknownBucketAlg(u8),

    #[error("unknown rule step: {0}")]
    UnknownStep(u8),

    #[error("rule {0} not present in the map")]
    UnknownRule(u32),

    #[error("bucket {0} not present in the map")]
    UnknownBucket(i32),

    #[error("selection from an empty bucket")]
    EmptyBucket,
}

/// How a bucket picks among its items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketAlg {
    /// Equal weights, round-robin by hash
    Uniform,
    /// Weighted independent draws
    Straw,
}

/// One item inside a bucket: a nested bucket (negative id) or a target
#[derive(Debug, Clone, Copy)]
struct BucketItem {
    id: i32,
    /// 16.16 fixed-point weight
    weight: u32,
}

#[derive(Debug, Clone)]
struct Bucket {
    alg: BucketAlg,
    items: Vec<BucketItem>,
}

/// One placement rule step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Reset the working set to one bucket
    Take(i32),
    /// Replace each working-set entry by n distinct children
    Choose(u8),
    /// Append resolved targets to the result
    Emit,
}

#[derive(Debug, Clone)]
struct Rule {
    name: String,
    steps: Vec<Step>,
}

/// A decoded placement map
#[derive(Debug, Clone, Default)]
pub struct PlacementMap {
    buckets: HashMap<i32, Bucket>,
    rules: HashMap<u32, Rule>,
}

/// Bounded little-endian reader that never reads past the buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], MapError> {
        if self.data.len() - self.pos < len {
            return Err(MapError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MapError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, MapError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, MapError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, MapError> {
        Ok(self.u32()? as i32)
    }
}

impl PlacementMap {
    /// The fallback when no map is configured: one rule (id 0) that always
    /// selects target 0.
    pub fn identity() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(
            -1,
            Bucket {
                alg: BucketAlg::Uniform,
                items: vec![BucketItem { id: 0, weight: 1 << 16 }],
            },
        );
        let mut rules = HashMap::new();
        rules.insert(
            0,
            Rule {
                name: "identity".to_string(),
                steps: vec![Step::Take(-1), Step::Choose(1), Step::Emit],
            },
        );
        Self { buckets, rules }
    }

    /// Load and decode a map file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MapError> {
        let data = std::fs::read(path)?;
        Self::decode(&data)
    }

    /// Decode a serialized map.
    pub fn decode(data: &[u8]) -> Result<Self, MapError> {
        let mut r = Reader::new(data);

        let magic = r.u32()?;
        if magic != MAP_MAGIC {
            return Err(MapError::BadMagic(magic));
        }
        let version = r.u8()?;
        if version != MAP_VERSION {
            return Err(MapError::BadVersion(version));
        }

        let bucket_count = r.u16()?;
        let rule_count = r.u16()?;

        let mut buckets = HashMap::with_capacity(bucket_count as usize);
        for _ in 0..bucket_count {
            let id = r.i32()?;
            let alg = match r.u8()? {
                1 => BucketAlg::Uniform,
                2 => BucketAlg::Straw,
                other => return Err(MapError::UnknownBucketAlg(other)),
            };
            let item_count = r.u16()?;
            let mut items = Vec::with_capacity(item_count as usize);
            for _ in 0..item_count {
                let item_id = r.i32()?;
                let weight = r.u32()?;
                items.push(BucketItem {
                    id: item_id,
                    weight,
                });
            }
            buckets.insert(id, Bucket { alg, items });
        }

        let mut rules = HashMap::with_capacity(rule_count as usize);
        for _ in 0..rule_count {
            let id = r.u32()?;
            let name_len = r.u8()? as usize;
            let name = String::from_utf8_lossy(r.bytes(name_len)?).into_owned();
            let step_count = r.u8()?;
            let mut steps = Vec::with_capacity(step_count as usize);
            for _ in 0..step_count {
                let step = match r.u8()? {
                    1 => Step::Take(r.i32()?),
                    2 => Step::Choose(r.u8()?),
                    3 => Step::Emit,
                    other => return Err(MapError::UnknownStep(other)),
                };
                steps.push(step);
            }
            rules.insert(id, Rule { name, steps });
        }

        Ok(Self { buckets, rules })
    }

    /// Find a rule id by name.
    pub fn rule_named(&self, name: &str) -> Option<u32> {
        self.rules
            .iter()
            .find(|(_, rule)| rule.name == name)
            .map(|(&id, _)| id)
    }

    pub fn has_rule(&self, id: u32) -> bool {
        self.rules.contains_key(&id)
    }

    /// Deterministically select the target set for (pool, object) under a
    /// rule. Returns the targets in selection order; the first entry is the
    /// primary.
    pub fn select(
        &self,
        rule_id: u32,
        pool: u32,
        object: u64,
    ) -> Result<Vec<u32>, MapError> {
        let rule = self
            .rules
            .get(&rule_id)
            .ok_or(MapError::UnknownRule(rule_id))?;

        let mut working: Vec<i32> = Vec::new();
        let mut out: Vec<u32> = Vec::new();

        for step in &rule.steps {
            match step {
                Step::Take(id) => {
                    if !self.buckets.contains_key(id) {
                        return Err(MapError::UnknownBucket(*id));
                    }
                    working.clear();
                    working.push(*id);
                }
                Step::Choose(n) => {
                    let mut next = Vec::new();
                    for &item in &working {
                        let bucket = self
                            .buckets
                            .get(&item)
                            .ok_or(MapError::UnknownBucket(item))?;
                        self.choose(bucket, pool, object, *n as usize, &mut next)?;
                    }
                    working = next;
                }
                Step::Emit => {
                    for &item in &working {
                        if item >= 0 {
                            out.push(item as u32);
                        } else {
                            // Emitting a bucket resolves one leaf below it
                            let bucket = self
                                .buckets
                                .get(&item)
                                .ok_or(MapError::UnknownBucket(item))?;
                            let mut leaf = Vec::new();
                            self.choose(bucket, pool, object, 1, &mut leaf)?;
                            out.extend(leaf.iter().map(|&id| id as u32));
                        }
                    }
                    working.clear();
                }
            }
        }

        Ok(out)
    }

    /// Pick `n` distinct children of a bucket, recursing into nested buckets.
    fn choose(
        &self,
        bucket: &Bucket,
        pool: u32,
        object: u64,
        n: usize,
        out: &mut Vec<i32>,
    ) -> Result<(), MapError> {
        let candidates: Vec<&BucketItem> =
            bucket.items.iter().filter(|item| item.weight > 0).collect();
        if candidates.is_empty() {
            return Err(MapError::EmptyBucket);
        }

        let mut chosen: Vec<i32> = Vec::with_capacity(n);
        let mut attempt = 0u32;
        while chosen.len() < n && attempt < (n as u32 + candidates.len() as u32) * 4 {
            let winner = match bucket.alg {
                BucketAlg::Uniform => {
                    let draw = placement_hash(pool, object, attempt as i32, attempt);
                    candidates[(draw % candidates.len() as u64) as usize]
                }
                BucketAlg::Straw => candidates
                    .iter()
                    .copied()
                    .max_by_key(|item| {
                        placement_hash(pool, object, item.id, attempt) as u128
                            * item.weight as u128
                    })
                    .unwrap(),
            };
            attempt += 1;
            if chosen.contains(&winner.id) {
                continue;
            }
            chosen.push(winner.id);
        }

        for id in chosen {
            if id >= 0 {
                out.push(id);
            } else {
                let nested = self.buckets.get(&id).ok_or(MapError::UnknownBucket(id))?;
                self.choose(nested, pool, object, 1, out)?;
            }
        }
        Ok(())
    }
}

/// The deterministic draw: xxh3 of (object, item, attempt) seeded by pool.
fn placement_hash(pool: u32, object: u64, item: i32, attempt: u32) -> u64 {
    let mut input = [0u8; 16];
    input[0..8].copy_from_slice(&object.to_le_bytes());
    input[8..12].copy_from_slice(&item.to_le_bytes());
    input[12..16].copy_from_slice(&attempt.to_le_bytes());
    xxh3_64_with_seed(&input, pool as u64)
}
