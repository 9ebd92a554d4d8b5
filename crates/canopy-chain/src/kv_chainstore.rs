//! Durable stores backed by a kv (key/value) database.
//!
//! Headers are kept in a single bucket keyed by height, together with a record of the current
//! tip under a key no real height can reach. Keeping both in one bucket lets a whole call go
//! out as one atomic [Batch].

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use kv::Batch;
use kv::Bucket;
use kv::Config;
use kv::Integer;
use kv::Store;
use log::debug;
use log::warn;
use spin::Mutex;

use crate::chainstore::check_batch_fits;
use crate::chainstore::BlocksRepository;
use crate::chainstore::HeadersRepository;
use crate::error::ChainError;
use crate::header::HeaderRecord;

/// Where we keep the tip height, inside the headers bucket
const TIP_KEY: u32 = u32::MAX;

pub struct KvHeadersStore<'a> {
    _store: Store,
    headers: Bucket<'a, Integer, Vec<u8>>,
    /// Serializes writers, so checking a batch and writing it can't interleave
    write_lock: Mutex<()>,
}

impl<'a> KvHeadersStore<'a> {
    /// Opens (or creates) the store under `datadir/headers`
    pub fn new(datadir: &str) -> Result<KvHeadersStore<'a>, kv::Error> {
        let cfg = Config::new(format!("{datadir}/headers")).cache_capacity(20_000_000);
        let store = Store::new(cfg)?;

        Ok(KvHeadersStore {
            headers: store.bucket(Some("headers"))?,
            _store: store,
            write_lock: Mutex::new(()),
        })
    }

    fn tip_height(&self) -> Result<Option<u32>, ChainError> {
        let Some(raw) = self.headers.get(&Integer::from(TIP_KEY))? else {
            return Ok(None);
        };

        let bytes: [u8; 4] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::HeadersInconsistency("corrupted tip record".into()))?;

        Ok(Some(u32::from_le_bytes(bytes)))
    }

    fn read(&self, height: u32) -> Result<Option<HeaderRecord>, ChainError> {
        match self.headers.get(&Integer::from(height))? {
            Some(bytes) => Ok(Some(HeaderRecord::from_bytes(&bytes, height)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.headers.flush()?;
        Ok(())
    }
}

impl HeadersRepository for KvHeadersStore<'_> {
    fn get_best_header(&self) -> Result<Option<HeaderRecord>, ChainError> {
        match self.tip_height()? {
            Some(height) => self.read(height),
            None => Ok(None),
        }
    }

    fn get_headers_since_height(&self, height: u32) -> Result<Vec<HeaderRecord>, ChainError> {
        let Some(tip) = self.tip_height()? else {
            return Ok(Vec::new());
        };

        let mut headers = Vec::new();
        for height in height..=tip {
            let header = self.read(height)?.ok_or_else(|| {
                ChainError::HeadersInconsistency(format!("missing header at height {height}"))
            })?;
            headers.push(header);
        }

        Ok(headers)
    }

    fn get_header_at_height(&self, height: u32) -> Result<Option<HeaderRecord>, ChainError> {
        if self.tip_height()?.is_some_and(|tip| height > tip) {
            return Ok(None);
        }
        self.read(height)
    }

    fn save_header(&self, header: &HeaderRecord) -> Result<(), ChainError> {
        self.save_headers(core::slice::from_ref(header))
    }

    fn save_headers(&self, batch: &[HeaderRecord]) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock();
        let tip = self.get_best_header()?;
        let skip = check_batch_fits(batch, tip.as_ref(), |height| self.read(height))?;

        let new = &batch[skip..];
        let Some(last) = new.last() else {
            return Ok(());
        };

        let mut writes = Batch::new();
        for header in new {
            writes.set(&Integer::from(header.height), &header.header_bytes.to_vec())?;
        }
        writes.set(&Integer::from(TIP_KEY), &last.height.to_le_bytes().to_vec())?;
        self.headers.batch(writes)?;

        Ok(())
    }

    fn remove_headers_after_height(&self, height: u32) -> Result<u32, ChainError> {
        let _guard = self.write_lock.lock();
        let Some(tip) = self.tip_height()? else {
            return Ok(0);
        };
        if tip <= height {
            return Ok(0);
        }

        let mut writes = Batch::new();
        for removed in (height + 1)..=tip {
            writes.remove(&Integer::from(removed))?;
        }
        writes.set(&Integer::from(TIP_KEY), &height.to_le_bytes().to_vec())?;
        self.headers.batch(writes)?;
        debug!("removed headers {} to {tip} from disk", height + 1);

        Ok(tip - height)
    }
}

/// Block bodies keyed by hash. Each value carries the block's height in its first four bytes,
/// so pruning doesn't need to parse blocks.
pub struct KvBlocksStore<'a> {
    _store: Store,
    blocks: Bucket<'a, Vec<u8>, Vec<u8>>,
}

impl<'a> KvBlocksStore<'a> {
    pub fn new(datadir: &str) -> Result<KvBlocksStore<'a>, kv::Error> {
        let cfg = Config::new(format!("{datadir}/blocks"));
        let store = Store::new(cfg)?;

        Ok(KvBlocksStore {
            blocks: store.bucket(Some("blocks"))?,
            _store: store,
        })
    }
}

impl BlocksRepository for KvBlocksStore<'_> {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, ChainError> {
        let value = self.blocks.get(&hash.to_byte_array().to_vec())?;
        Ok(value.and_then(|value| value.get(4..).map(|block| block.to_vec())))
    }

    fn save_block(&self, hash: BlockHash, height: u32, block: Vec<u8>) -> Result<(), ChainError> {
        let mut value = height.to_le_bytes().to_vec();
        value.extend(block);
        self.blocks.set(&hash.to_byte_array().to_vec(), &value)?;

        Ok(())
    }

    fn prune_below(&self, height: u32) -> Result<usize, ChainError> {
        let mut writes = Batch::new();
        let mut pruned = 0;
        for item in self.blocks.iter() {
            let item = item?;
            let value: Vec<u8> = item.value()?;
            let Some(stored_height) = value.get(..4) else {
                warn!("skipping a stored block without a height");
                continue;
            };

            let mut bytes = [0_u8; 4];
            bytes.copy_from_slice(stored_height);
            if u32::from_le_bytes(bytes) < height {
                writes.remove(&item.key::<Vec<u8>>()?)?;
                pruned += 1;
            }
        }
        self.blocks.batch(writes)?;

        Ok(pruned)
    }
}
