/// A separate-chaining hash table keyed by `u64`, rehashed by doubling (plus
/// one) whenever the load factor crosses `rehash_ratio`.
///
/// This is the direct Rust rendering of
/// `original_source/lib/src/hash_table.c`'s `ARMD__HashTable`: buckets are
/// ordinary `Vec<(u64, V)>` chains rather than the C version's sentinel-node
/// linked lists, since Rust's `Vec` already gives the same amortized-growth
/// chain storage without hand-rolled node pointers.
pub struct HashTable<V> {
    buckets: Vec<Vec<(u64, V)>>,
    num_entries: usize,
    rehash_ratio: f64,
}

/// Outcome of [`HashTable::upsert`], matching `armd__hash_table_upsert`'s
/// `0`-means-replaced / `1`-means-inserted return convention.
#[derive(Debug, Eq, PartialEq)]
pub enum Upsert<V> {
    Replaced(V),
    Inserted,
}

impl<V> HashTable<V> {
    pub fn new(initial_table_size: usize, rehash_ratio: f64) -> Self {
        assert!(initial_table_size > 0, "initial_table_size must be nonzero");
        assert!(rehash_ratio > 0.0, "rehash_ratio must be positive");

        let mut buckets = Vec::with_capacity(initial_table_size);
        buckets.resize_with(initial_table_size, Vec::new);

        HashTable {
            buckets,
            num_entries: 0,
            rehash_ratio,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn len(&self) -> usize {
        self.num_entries
    }

    fn bucket_index(&self, key: u64, table_size: usize) -> usize {
        (key % table_size as u64) as usize
    }

    fn rehash_if_needed(&mut self) {
        let table_size = self.buckets.len();
        if self.rehash_ratio * table_size as f64 > self.num_entries as f64 {
            return;
        }

        let new_size = table_size * 2 + 1;
        let mut new_buckets = Vec::with_capacity(new_size);
        new_buckets.resize_with(new_size, Vec::new);

        for bucket in self.buckets.drain(..) {
            for (key, value) in bucket {
                let idx = (key % new_size as u64) as usize;
                new_buckets[idx].push((key, value));
            }
        }

        self.buckets = new_buckets;
    }

    /// Inserts a new key. Fails if the key is already present, matching
    /// `armd__hash_table_insert`'s `-1`-on-duplicate contract.
    pub fn insert(&mut self, key: u64, value: V) -> Result<(), V> {
        self.rehash_if_needed();
        let idx = self.bucket_index(key, self.buckets.len());
        if self.buckets[idx].iter().any(|(k, _)| *k == key) {
            return Err(value);
        }
        self.buckets[idx].push((key, value));
        self.num_entries += 1;
        Ok(())
    }

    /// Replaces the value for an existing key, returning the old one. Fails
    /// if the key is absent, matching `armd__hash_table_update`.
    pub fn update(&mut self, key: u64, new_value: V) -> Result<V, V> {
        let idx = self.bucket_index(key, self.buckets.len());
        for entry in self.buckets[idx].iter_mut() {
            if entry.0 == key {
                return Ok(std::mem::replace(&mut entry.1, new_value));
            }
        }
        Err(new_value)
    }

    /// Inserts or replaces, reporting which happened -- `armd__hash_table_upsert`.
    pub fn upsert(&mut self, key: u64, new_value: V) -> Upsert<V> {
        self.rehash_if_needed();
        let idx = self.bucket_index(key, self.buckets.len());
        for entry in self.buckets[idx].iter_mut() {
            if entry.0 == key {
                let old = std::mem::replace(&mut entry.1, new_value);
                return Upsert::Replaced(old);
            }
        }
        self.buckets[idx].push((key, new_value));
        self.num_entries += 1;
        Upsert::Inserted
    }

    pub fn exists(&self, key: u64) -> bool {
        let idx = self.bucket_index(key, self.buckets.len());
        self.buckets[idx].iter().any(|(k, _)| *k == key)
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        let idx = self.bucket_index(key, self.buckets.len());
        self.buckets[idx]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        let idx = self.bucket_index(key, self.buckets.len());
        self.buckets[idx]
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: u64) -> Option<V> {
        let idx = self.bucket_index(key, self.buckets.len());
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.iter().position(|(k, _)| *k == key) {
            self.num_entries -= 1;
            Some(bucket.remove(pos).1)
        } else {
            None
        }
    }
}

impl<V> std::fmt::Debug for HashTable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("num_entries", &self.num_entries)
            .field("table_size", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_round_trip() {
        let mut t = HashTable::new(4, 1.0);
        assert!(t.insert(1, "one").is_ok());
        assert!(t.insert(1, "dup").is_err());
        assert_eq!(t.get(1), Some(&"one"));
        assert!(t.exists(1));
        assert_eq!(t.remove(1), Some("one"));
        assert!(!t.exists(1));
        assert_eq!(t.remove(1), None);
    }

    #[test]
    fn upsert_reports_inserted_then_replaced() {
        let mut t = HashTable::new(4, 1.0);
        assert_eq!(t.upsert(5, 1), Upsert::Inserted);
        assert_eq!(t.upsert(5, 2), Upsert::Replaced(1));
        assert_eq!(t.get(5), Some(&2));
    }

    #[test]
    fn grows_and_keeps_all_entries_reachable() {
        let mut t = HashTable::new(1, 1.0);
        for i in 0..500u64 {
            t.insert(i, i * 2).unwrap();
        }
        assert_eq!(t.num_entries(), 500);
        for i in 0..500u64 {
            assert_eq!(t.get(i), Some(&(i * 2)));
        }
    }

    #[test]
    fn update_fails_on_missing_key() {
        let mut t: HashTable<i32> = HashTable::new(4, 1.0);
        assert!(t.update(1, 9).is_err());
    }

    #[test]
    fn randomized_insert_remove_leaves_only_the_survivors() {
        use rand::{Rng, RngCore, SeedableRng, XorShiftRng};

        let mut t = HashTable::new(4, 0.75);
        let mut model = std::collections::HashMap::new();
        let mut rng = XorShiftRng::from_seed([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);

        for _ in 0..2000 {
            let key: u64 = rng.gen_range(0, 64);
            if rng.next_u32() % 2 == 0 {
                let inserted = t.insert(key, key * 10).is_ok();
                assert_eq!(inserted, !model.contains_key(&key));
                model.entry(key).or_insert(key * 10);
            } else {
                let removed = t.remove(key);
                assert_eq!(removed, model.remove(&key));
            }
        }

        for key in 0..64u64 {
            assert_eq!(t.get(key), model.get(&key));
            assert_eq!(t.exists(key), model.contains_key(&key));
        }
        assert_eq!(t.num_entries(), model.len());
    }
}
