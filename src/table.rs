use super::heap::Gc;
use super::value::Value;

/// FNV-1a over the raw bytes.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash = 2166136261u32;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy)]
struct Entry {
    key: Option<Gc>,
    hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: None,
            hash: 0,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value != Value::Nil
    }
}

/// Open-addressed map with linear probing and tombstones. Keys are interned
/// string handles compared by identity; each entry remembers its key's hash
/// so resizing never has to look back into the heap.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], key: Gc, hash: u32) -> usize {
        let mut idx = hash as usize & (entries.len() - 1);
        let mut tombstone = None;

        loop {
            let entry = &entries[idx];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return tombstone.unwrap_or(idx);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Some(entry_key) => {
                    if entry_key == key {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & (entries.len() - 1);
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() < 8 {
            8
        } else {
            self.capacity() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); new_capacity]);

        // live entries only; tombstones are dropped and count rebuilt
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let idx = Self::find_entry(&self.entries, key, entry.hash);
                self.entries[idx] = entry;
                self.count += 1;
            }
        }
    }

    pub fn get(&self, key: Gc, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let idx = Self::find_entry(&self.entries, key, hash);
        self.entries[idx].key.map(|_| self.entries[idx].value)
    }

    /// Returns true when `key` was not present before.
    pub fn set(&mut self, key: Gc, hash: u32, value: Value) -> bool {
        if (self.count + 1) * 4 > self.capacity() * 3 {
            self.grow();
        }

        let idx = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[idx];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    pub fn delete(&mut self, key: Gc, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = Self::find_entry(&self.entries, key, hash);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry {
            key: None,
            hash: 0,
            value: Value::Bool(true),
        };
        true
    }

    /// Content-based lookup used only by string interning.
    pub fn find_string<'h>(
        &self,
        chars: &str,
        hash: u32,
        resolve: impl Fn(Gc) -> &'h str,
    ) -> Option<Gc> {
        if self.count == 0 {
            return None;
        }
        let mut idx = hash as usize & (self.capacity() - 1);
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash && resolve(key) == chars {
                        return Some(key);
                    }
                }
            }
            idx = (idx + 1) & (self.capacity() - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gc, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Tombstones every entry whose key is unmarked. The intern table holds
    /// its keys weakly, so this runs between marking and sweeping.
    pub fn remove_white(&mut self, is_marked: impl Fn(Gc) -> bool) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !is_marked(key) {
                    *entry = Entry {
                        key: None,
                        hash: 0,
                        value: Value::Bool(true),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn key(heap: &mut Heap, chars: &str) -> (Gc, u32) {
        (heap.intern(chars), hash_string(chars))
    }

    #[test]
    fn set_get_and_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "a");

        assert!(table.set(a, ha, Value::Number(1.0)));
        assert_eq!(table.get(a, ha), Some(Value::Number(1.0)));
        assert!(!table.set(a, ha, Value::Number(2.0)));
        assert_eq!(table.get(a, ha), Some(Value::Number(2.0)));
    }

    #[test]
    fn missing_keys_and_deletes() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "a");
        let (b, hb) = key(&mut heap, "b");

        assert_eq!(table.get(a, ha), None);
        assert!(!table.delete(a, ha));

        table.set(a, ha, Value::Nil);
        table.set(b, hb, Value::Bool(true));
        assert!(table.delete(a, ha));
        assert_eq!(table.get(a, ha), None);
        assert_eq!(table.get(b, hb), Some(Value::Bool(true)));
    }

    #[test]
    fn reinsert_after_delete_reuses_the_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "a");

        table.set(a, ha, Value::Number(1.0));
        table.delete(a, ha);
        assert!(table.set(a, ha, Value::Number(2.0)));
        assert_eq!(table.get(a, ha), Some(Value::Number(2.0)));
    }

    #[test]
    fn survives_growth_with_many_keys() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut keys = Vec::new();
        for i in 0..64 {
            let (k, h) = key(&mut heap, &format!("key-{i}"));
            table.set(k, h, Value::Number(i as f64));
            keys.push((k, h));
        }
        for (i, (k, h)) in keys.iter().enumerate() {
            assert_eq!(table.get(*k, *h), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut heap = Heap::new();
        let (a, ha) = key(&mut heap, "needle");
        let mut table = Table::new();
        table.set(a, ha, Value::Nil);

        let found = table.find_string("needle", ha, |gc| heap.string(gc).chars.as_str());
        assert_eq!(found, Some(a));
        let missing = table.find_string("haystack", hash_string("haystack"), |gc| {
            heap.string(gc).chars.as_str()
        });
        assert_eq!(missing, None);
    }

    #[test]
    fn remove_white_drops_only_unmarked_keys() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let (a, ha) = key(&mut heap, "kept");
        let (b, hb) = key(&mut heap, "dropped");
        table.set(a, ha, Value::Nil);
        table.set(b, hb, Value::Nil);

        table.remove_white(|gc| gc == a);
        assert_eq!(table.get(a, ha), Some(Value::Nil));
        assert_eq!(table.get(b, hb), None);
    }
}
