// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use engine::{
    EngineCookie, EngineError, EngineResult, FailoverEntry, Item, KvEngine, MutationResult,
    ObserveState, RawResponse, StoreSemantics,
};

use bytes::Bytes;

impl MemoryBucket {
    /// Remove an entry if it has passed its expiry, reporting whether the key
    /// is live afterwards.
    fn expire_if_needed(data: &mut HashMap<Vec<u8>, Stored>, key: &[u8], now: u64) -> bool {
        if let Some(stored) = data.get(key) {
            if stored.is_expired(now) {
                data.remove(key);
                ITEM_EXPIRE.increment();
                return false;
            }
            true
        } else {
            false
        }
    }
}

impl KvEngine for MemoryBucket {
    fn get(&self, _cookie: &EngineCookie, key: &[u8], _vbucket: u16) -> EngineResult<Item> {
        ITEM_GET.increment();
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        if !Self::expire_if_needed(&mut data, key, now) {
            ITEM_GET_MISS.increment();
            return Err(EngineError::KeyNotFound);
        }
        Ok(data.get(key).map(|s| s.item.clone()).unwrap())
    }

    fn get_if(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        filter: &mut dyn FnMut(&Item) -> bool,
    ) -> EngineResult<Option<Item>> {
        let item = self.get(cookie, key, vbucket)?;
        if filter(&item) {
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }

    fn get_and_touch(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        _vbucket: u16,
        expiry: u32,
    ) -> EngineResult<Item> {
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        if !Self::expire_if_needed(&mut data, key, now) {
            return Err(EngineError::KeyNotFound);
        }
        let stored = data.get_mut(key).unwrap();
        if stored.is_locked(now) {
            return Err(EngineError::Locked);
        }
        stored.item.expiry = absolute_expiry(expiry);
        stored.item.cas = self.next_cas();
        Ok(stored.item.clone())
    }

    fn get_locked(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        _vbucket: u16,
        lock_timeout: u32,
    ) -> EngineResult<Item> {
        let timeout = if lock_timeout == 0 {
            DEFAULT_LOCK_SECONDS
        } else {
            lock_timeout
        };
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        if !Self::expire_if_needed(&mut data, key, now) {
            return Err(EngineError::KeyNotFound);
        }
        let stored = data.get_mut(key).unwrap();
        if stored.is_locked(now) {
            return Err(EngineError::TemporaryFailure);
        }
        stored.locked_until = now + u64::from(timeout);
        // a lock hands out a fresh cas which is required to unlock
        stored.item.cas = self.next_cas();
        Ok(stored.item.clone())
    }

    fn unlock(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        _vbucket: u16,
        cas: u64,
    ) -> EngineResult<()> {
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        if !Self::expire_if_needed(&mut data, key, now) {
            return Err(EngineError::KeyNotFound);
        }
        let stored = data.get_mut(key).unwrap();
        if !stored.is_locked(now) {
            return Err(EngineError::TemporaryFailure);
        }
        if stored.item.cas != cas {
            return Err(EngineError::Locked);
        }
        stored.locked_until = 0;
        Ok(())
    }

    fn store(
        &self,
        cookie: &EngineCookie,
        key: &[u8],
        vbucket: u16,
        item: Item,
        cas: u64,
        semantics: StoreSemantics,
    ) -> EngineResult<MutationResult> {
        self.store_if(cookie, key, vbucket, item, cas, semantics, &mut |_| true)
    }

    fn store_if(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        _vbucket: u16,
        mut item: Item,
        cas: u64,
        semantics: StoreSemantics,
        predicate: &mut dyn FnMut(Option<&Item>) -> bool,
    ) -> EngineResult<MutationResult> {
        ITEM_STORE.increment();
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        let live = Self::expire_if_needed(&mut data, key, now);
        let existing = data.get(key);

        if !predicate(existing.map(|s| &s.item)) {
            return Err(EngineError::NotStored);
        }

        match semantics {
            StoreSemantics::Add => {
                if live {
                    return Err(EngineError::KeyExists);
                }
            }
            StoreSemantics::Replace | StoreSemantics::Append | StoreSemantics::Prepend => {
                if !live {
                    return Err(EngineError::KeyNotFound);
                }
            }
            StoreSemantics::Set => {}
        }

        if let Some(stored) = existing {
            if stored.is_locked(now) && (cas == 0 || cas != stored.item.cas) {
                return Err(EngineError::Locked);
            }
            if cas != 0 && cas != stored.item.cas {
                return Err(EngineError::KeyExists);
            }
        } else if cas != 0 {
            return Err(EngineError::KeyNotFound);
        }

        match semantics {
            StoreSemantics::Append => {
                let old = &data.get(key).unwrap().item;
                let mut combined = Vec::with_capacity(old.value.len() + item.value.len());
                combined.extend_from_slice(&old.value);
                combined.extend_from_slice(&item.value);
                // concatenation keeps the original flags and expiry
                item.flags = old.flags;
                item.expiry = old.expiry;
                item.value = Bytes::from(combined);
            }
            StoreSemantics::Prepend => {
                let old = &data.get(key).unwrap().item;
                let mut combined = Vec::with_capacity(old.value.len() + item.value.len());
                combined.extend_from_slice(&item.value);
                combined.extend_from_slice(&old.value);
                item.flags = old.flags;
                item.expiry = old.expiry;
                item.value = Bytes::from(combined);
            }
            _ => {
                item.expiry = absolute_expiry(item.expiry);
            }
        }

        item.cas = self.next_cas();
        item.seqno = self.next_seqno();
        let result = MutationResult {
            cas: item.cas,
            seqno: item.seqno,
            vbucket_uuid: self.uuid,
        };

        data.insert(
            key.to_vec(),
            Stored {
                item,
                locked_until: 0,
            },
        );

        Ok(result)
    }

    fn remove(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        _vbucket: u16,
        cas: u64,
    ) -> EngineResult<MutationResult> {
        ITEM_REMOVE.increment();
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        if !Self::expire_if_needed(&mut data, key, now) {
            return Err(EngineError::KeyNotFound);
        }
        let stored = data.get(key).unwrap();
        if stored.is_locked(now) && (cas == 0 || cas != stored.item.cas) {
            return Err(EngineError::Locked);
        }
        if cas != 0 && cas != stored.item.cas {
            return Err(EngineError::KeyExists);
        }
        data.remove(key);
        Ok(MutationResult {
            cas: self.next_cas(),
            seqno: self.next_seqno(),
            vbucket_uuid: self.uuid,
        })
    }

    fn arithmetic(
        &self,
        _cookie: &EngineCookie,
        key: &[u8],
        _vbucket: u16,
        delta: u64,
        initial: u64,
        create: bool,
        increment: bool,
        expiry: u32,
    ) -> EngineResult<(u64, MutationResult)> {
        let mut data = self.data.lock().unwrap();
        let now = unix_now();
        let live = Self::expire_if_needed(&mut data, key, now);

        let value = if live {
            let stored = data.get(key).unwrap();
            if stored.is_locked(now) {
                return Err(EngineError::Locked);
            }
            let current: u64 = std::str::from_utf8(&stored.item.value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or(EngineError::DeltaBadval)?;
            if increment {
                current.wrapping_add(delta)
            } else {
                current.saturating_sub(delta)
            }
        } else {
            if !create {
                return Err(EngineError::KeyNotFound);
            }
            initial
        };

        let mut item = Item::new(
            Bytes::from(value.to_string()),
            0,
            0,
            if live {
                data.get(key).unwrap().item.expiry
            } else {
                absolute_expiry(expiry)
            },
        );
        item.cas = self.next_cas();
        item.seqno = self.next_seqno();
        let result = MutationResult {
            cas: item.cas,
            seqno: item.seqno,
            vbucket_uuid: self.uuid,
        };

        data.insert(
            key.to_vec(),
            Stored {
                item,
                locked_until: 0,
            },
        );

        Ok((value, result))
    }

    fn flush(&self, _cookie: &EngineCookie) -> EngineResult<()> {
        let mut data = self.data.lock().unwrap();
        debug!("flushing bucket {} ({} items)", self.name, data.len());
        data.clear();
        Ok(())
    }

    fn stats(
        &self,
        _cookie: &EngineCookie,
        _key: &[u8],
        visitor: &mut dyn FnMut(&str, &str),
    ) -> EngineResult<()> {
        let (items, bytes) = {
            let data = self.data.lock().unwrap();
            let bytes: usize = data.values().map(|s| s.item.value.len()).sum();
            (data.len(), bytes)
        };
        visitor("curr_items", &items.to_string());
        visitor("bytes", &bytes.to_string());
        visitor("high_seqno", &self.high_seqno().to_string());
        visitor("vb_uuid", &self.uuid.to_string());
        visitor("cmd_get", &ITEM_GET.value().to_string());
        visitor("cmd_set", &ITEM_STORE.value().to_string());
        Ok(())
    }

    fn reset_stats(&self, _cookie: &EngineCookie) -> EngineResult<()> {
        ITEM_GET.reset();
        ITEM_GET_MISS.reset();
        ITEM_STORE.reset();
        ITEM_REMOVE.reset();
        ITEM_EXPIRE.reset();
        Ok(())
    }

    fn observe_seqno(
        &self,
        _cookie: &EngineCookie,
        _vbucket: u16,
        uuid: u64,
    ) -> EngineResult<ObserveState> {
        if uuid != 0 && uuid != self.uuid {
            return Err(EngineError::KeyNotFound);
        }
        let seqno = self.high_seqno();
        Ok(ObserveState {
            vbucket_uuid: self.uuid,
            // everything is "persisted" the moment it lands in memory
            last_persisted_seqno: seqno,
            current_seqno: seqno,
        })
    }

    fn seqno_persistence(
        &self,
        _cookie: &EngineCookie,
        _vbucket: u16,
        seqno: u64,
    ) -> EngineResult<()> {
        if seqno > self.high_seqno() {
            return Err(EngineError::TemporaryFailure);
        }
        Ok(())
    }

    fn get_failover_log(
        &self,
        _cookie: &EngineCookie,
        _vbucket: u16,
    ) -> EngineResult<Vec<FailoverEntry>> {
        Ok(self.failover.lock().unwrap().clone())
    }

    fn set_collections_manifest(&self, _cookie: &EngineCookie, json: &[u8]) -> EngineResult<()> {
        let parsed: serde_json::Value =
            serde_json::from_slice(json).map_err(|_| EngineError::InvalidArguments)?;

        let uid = parsed
            .get("uid")
            .and_then(|v| v.as_str())
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .ok_or(EngineError::InvalidArguments)?;

        let mut ids = HashMap::new();
        let scopes = parsed
            .get("scopes")
            .and_then(|v| v.as_array())
            .ok_or(EngineError::InvalidArguments)?;
        for scope in scopes {
            let scope_name = scope
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or(EngineError::InvalidArguments)?;
            let collections = scope
                .get("collections")
                .and_then(|v| v.as_array())
                .ok_or(EngineError::InvalidArguments)?;
            for collection in collections {
                let name = collection
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or(EngineError::InvalidArguments)?;
                let cid = collection
                    .get("uid")
                    .and_then(|v| v.as_str())
                    .and_then(|s| u32::from_str_radix(s, 16).ok())
                    .ok_or(EngineError::InvalidArguments)?;
                ids.insert(format!("{}.{}", scope_name, name), cid);
            }
        }

        let mut manifest = self.manifest.lock().unwrap();
        manifest.uid = uid;
        manifest.raw = Bytes::from(json.to_vec());
        manifest.ids = ids;
        Ok(())
    }

    fn get_collections_manifest(&self, _cookie: &EngineCookie) -> EngineResult<Bytes> {
        Ok(self.manifest.lock().unwrap().raw.clone())
    }

    fn get_collection_id(&self, _cookie: &EngineCookie, path: &str) -> EngineResult<(u64, u32)> {
        let manifest = self.manifest.lock().unwrap();
        match manifest.ids.get(path) {
            Some(cid) => Ok((manifest.uid, *cid)),
            None => Err(EngineError::UnknownCollection),
        }
    }

    fn unknown_command(
        &self,
        _cookie: &EngineCookie,
        _packet: &[u8],
    ) -> EngineResult<RawResponse> {
        Err(EngineError::UnknownCommand)
    }

    fn on_disconnect(&self, _cookie: &EngineCookie) {}
}
