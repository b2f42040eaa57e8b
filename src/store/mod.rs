/// Key-value store adapter
///
/// Buckets of packed records, secondary indexes and single-writer
/// transactions on top of redb. A write transaction commits atomically or not
/// at all: returning an error from an update closure, or panicking inside
/// it, drops the transaction uncommitted.

pub mod codec;
pub mod tables;

use crate::error::AppResult;
use codec::CodecError;
use redb::{
    Database, MultimapTableDefinition, ReadableDatabase, ReadableMultimapTable, ReadableTable,
    TableDefinition, TableHandle,
};
use std::path::Path;
use std::sync::Arc;

/// A record type stored in a bucket keyed by integer id
pub trait Record: Sized {
    const BUCKET: TableDefinition<'static, u64, &'static [u8]>;

    fn id(&self) -> u64;

    fn pack(&self) -> Vec<u8>;

    fn unpack(buf: &[u8]) -> Result<Self, CodecError>;
}

/// Secondary index: term -> targets, plus target -> term
#[derive(Clone, Copy)]
pub struct Index {
    terms: MultimapTableDefinition<'static, u64, u64>,
    owners: TableDefinition<'static, u64, u64>,
}

impl Index {
    pub const fn new(terms: &'static str, owners: &'static str) -> Self {
        Self {
            terms: MultimapTableDefinition::new(terms),
            owners: TableDefinition::new(owners),
        }
    }
}

/// Page of index targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: usize,
    pub limit: usize,
    /// Highest ids first
    pub newest_first: bool,
}

impl Window {
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
            newest_first: false,
        }
    }

    pub fn newest(limit: usize, offset: usize) -> Self {
        Self {
            offset,
            limit,
            newest_first: true,
        }
    }
}

/// Handle to the embedded database
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Opens or creates the database and makes sure every table exists
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        for bucket in tables::ALL_BUCKETS {
            txn.open_table(bucket)?;
        }
        for lookup in tables::ALL_LOOKUPS {
            txn.open_table(lookup)?;
        }
        for index in tables::ALL_INDEXES {
            txn.open_multimap_table(index.terms)?;
            txn.open_table(index.owners)?;
        }
        txn.commit()?;

        tracing::debug!(path = %path.display(), "KV store opened");

        Ok(Self { db: Arc::new(db) })
    }

    pub fn begin_read(&self) -> AppResult<ReadTx> {
        Ok(ReadTx {
            txn: self.db.begin_read()?,
        })
    }

    /// Blocks while another write transaction is active
    pub fn begin_write(&self) -> AppResult<WriteTx> {
        Ok(WriteTx {
            txn: self.db.begin_write()?,
        })
    }

    /// Run `f` in a read transaction
    pub fn view<T>(&self, f: impl FnOnce(&ReadTx) -> AppResult<T>) -> AppResult<T> {
        let tx = self.begin_read()?;
        f(&tx)
    }

    /// Run `f` in a write transaction, committing only if it returns Ok
    pub fn update<T>(&self, f: impl FnOnce(&WriteTx) -> AppResult<T>) -> AppResult<T> {
        let tx = self.begin_write()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// `view` on the blocking pool, for async callers
    pub async fn view_blocking<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&ReadTx) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.view(f)).await?
    }

    /// `update` on the blocking pool, for async callers
    pub async fn update_blocking<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&WriteTx) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.update(f)).await?
    }
}

fn read_record<R, T>(table: &T, id: u64) -> AppResult<Option<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id)? {
        Some(guard) => Ok(Some(R::unpack(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_records<R, T>(table: &T) -> AppResult<Vec<R>>
where
    R: Record,
    T: ReadableTable<u64, &'static [u8]>,
{
    let mut out = Vec::new();
    for item in table.iter()? {
        let (_, value) = item?;
        out.push(R::unpack(value.value())?);
    }
    Ok(out)
}

fn read_lookup<T>(table: &T, key: &str) -> AppResult<Option<u64>>
where
    T: ReadableTable<&'static str, u64>,
{
    Ok(table.get(key)?.map(|guard| guard.value()))
}

fn read_targets<T>(table: &T, term: u64, window: Window) -> AppResult<Vec<u64>>
where
    T: ReadableMultimapTable<u64, u64>,
{
    let mut targets = Vec::new();
    for item in table.get(term)? {
        targets.push(item?.value());
    }
    if window.newest_first {
        targets.reverse();
    }
    Ok(targets
        .into_iter()
        .skip(window.offset)
        .take(window.limit)
        .collect())
}

/// Read-only snapshot
pub struct ReadTx {
    txn: redb::ReadTransaction,
}

impl ReadTx {
    pub fn get<R: Record>(&self, id: u64) -> AppResult<Option<R>> {
        read_record(&self.txn.open_table(R::BUCKET)?, id)
    }

    pub fn scan<R: Record>(&self) -> AppResult<Vec<R>> {
        scan_records(&self.txn.open_table(R::BUCKET)?)
    }

    pub fn lookup(&self, table: TableDefinition<&str, u64>, key: &str) -> AppResult<Option<u64>> {
        read_lookup(&self.txn.open_table(table)?, key)
    }

    pub fn targets(&self, index: Index, term: u64, window: Window) -> AppResult<Vec<u64>> {
        read_targets(&self.txn.open_multimap_table(index.terms)?, term, window)
    }

    /// Resolve index targets to records, skipping dangling entries
    pub fn records_for<R: Record>(
        &self,
        index: Index,
        term: u64,
        window: Window,
    ) -> AppResult<Vec<R>> {
        let table = self.txn.open_table(R::BUCKET)?;
        let mut out = Vec::new();
        for id in self.targets(index, term, window)? {
            if let Some(record) = read_record(&table, id)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

/// The single active write transaction
pub struct WriteTx {
    txn: redb::WriteTransaction,
}

impl WriteTx {
    pub fn get<R: Record>(&self, id: u64) -> AppResult<Option<R>> {
        read_record(&self.txn.open_table(R::BUCKET)?, id)
    }

    pub fn put<R: Record>(&self, record: &R) -> AppResult<()> {
        let mut table = self.txn.open_table(R::BUCKET)?;
        table.insert(record.id(), record.pack().as_slice())?;
        Ok(())
    }

    /// Returns whether the record existed
    pub fn delete<R: Record>(&self, id: u64) -> AppResult<bool> {
        let mut table = self.txn.open_table(R::BUCKET)?;
        let removed = table.remove(id)?.is_some();
        Ok(removed)
    }

    /// Allocate the next id for `R`'s bucket. Ids are never reused.
    pub fn next_id<R: Record>(&self) -> AppResult<u64> {
        let mut seq = self.txn.open_table(tables::SEQUENCES)?;
        let name = R::BUCKET.name();
        let next = read_lookup(&seq, name)?.unwrap_or(0) + 1;
        seq.insert(name, next)?;
        Ok(next)
    }

    pub fn lookup(&self, table: TableDefinition<&str, u64>, key: &str) -> AppResult<Option<u64>> {
        read_lookup(&self.txn.open_table(table)?, key)
    }

    pub fn set_lookup(&self, table: TableDefinition<&str, u64>, key: &str, value: u64) -> AppResult<()> {
        self.txn.open_table(table)?.insert(key, value)?;
        Ok(())
    }

    pub fn remove_lookup(&self, table: TableDefinition<&str, u64>, key: &str) -> AppResult<bool> {
        let mut table = self.txn.open_table(table)?;
        let removed = table.remove(key)?.is_some();
        Ok(removed)
    }

    pub fn targets(&self, index: Index, term: u64, window: Window) -> AppResult<Vec<u64>> {
        read_targets(&self.txn.open_multimap_table(index.terms)?, term, window)
    }

    /// Index `target` under `term`, replacing any term it had before
    pub fn set_term(&self, index: Index, target: u64, term: u64) -> AppResult<()> {
        let mut owners = self.txn.open_table(index.owners)?;
        let mut terms = self.txn.open_multimap_table(index.terms)?;

        let previous = owners.get(target)?.map(|guard| guard.value());
        if let Some(old) = previous {
            if old == term {
                return Ok(());
            }
            terms.remove(old, target)?;
        }
        terms.insert(term, target)?;
        owners.insert(target, term)?;
        Ok(())
    }

    /// Drop `target` from the index
    pub fn clear_target(&self, index: Index, target: u64) -> AppResult<()> {
        let mut owners = self.txn.open_table(index.owners)?;
        let mut terms = self.txn.open_multimap_table(index.terms)?;

        let previous = owners.remove(target)?.map(|guard| guard.value());
        if let Some(old) = previous {
            terms.remove(old, target)?;
        }
        Ok(())
    }

    pub fn commit(self) -> AppResult<()> {
        self.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("test.redb")).unwrap();
    (dir, store)
}

#[cfg(test)]
mod tests {
    use super::codec::{Packer, Unpacker};
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: u64,
        body: String,
    }

    impl Record for Note {
        const BUCKET: TableDefinition<'static, u64, &'static [u8]> = tables::USERS;

        fn id(&self) -> u64 {
            self.id
        }

        fn pack(&self) -> Vec<u8> {
            let mut p = Packer::new(1);
            p.u64(self.id).str(&self.body);
            p.finish()
        }

        fn unpack(buf: &[u8]) -> Result<Self, CodecError> {
            let (mut u, _) = Unpacker::new("note", buf, &[1])?;
            Ok(Self {
                id: u.u64()?,
                body: u.str()?,
            })
        }
    }

    #[test]
    fn test_uncommitted_write_leaves_store_unchanged() {
        let (_dir, store) = test_store();

        {
            let tx = store.begin_write().unwrap();
            tx.put(&Note { id: 1, body: "draft".into() }).unwrap();
            // dropped without commit
        }

        let found: Option<Note> = store.view(|tx| tx.get(1)).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let (_dir, store) = test_store();

        let result: AppResult<()> = store.update(|tx| {
            tx.put(&Note { id: 1, body: "x".into() })?;
            Err(crate::error::AppError::Validation("nope".into()))
        });
        assert!(result.is_err());

        let found: Option<Note> = store.view(|tx| tx.get(1)).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_next_id_is_monotonic_after_delete() {
        let (_dir, store) = test_store();

        let first = store
            .update(|tx| {
                let id = tx.next_id::<Note>()?;
                tx.put(&Note { id, body: "a".into() })?;
                Ok(id)
            })
            .unwrap();
        store.update(|tx| tx.delete::<Note>(first)).unwrap();
        let second = store.update(|tx| tx.next_id::<Note>()).unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_set_term_replaces_previous_term() {
        let (_dir, store) = test_store();
        let index = tables::USERS_BY_FAMILY;

        store
            .update(|tx| {
                tx.set_term(index, 10, 1)?;
                tx.set_term(index, 11, 1)?;
                tx.set_term(index, 10, 2)
            })
            .unwrap();

        store
            .view(|tx| {
                assert_eq!(tx.targets(index, 1, Window::all())?, vec![11]);
                assert_eq!(tx.targets(index, 2, Window::all())?, vec![10]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_targets_window_newest_first() {
        let (_dir, store) = test_store();
        let index = tables::CHAT_MESSAGES_BY_FAMILY;

        store
            .update(|tx| {
                for target in 1..=5 {
                    tx.set_term(index, target, 7)?;
                }
                Ok(())
            })
            .unwrap();

        let page = store
            .view(|tx| tx.targets(index, 7, Window::newest(2, 1)))
            .unwrap();
        assert_eq!(page, vec![4, 3]);
    }

    #[test]
    fn test_clear_target() {
        let (_dir, store) = test_store();
        let index = tables::IMAGE_BY_PERSON;

        store.update(|tx| tx.set_term(index, 3, 9)).unwrap();
        store.update(|tx| tx.clear_target(index, 3)).unwrap();

        let targets = store.view(|tx| tx.targets(index, 9, Window::all())).unwrap();
        assert!(targets.is_empty());
    }

    #[test]
    fn test_lookup_roundtrip() {
        let (_dir, store) = test_store();

        store
            .update(|tx| tx.set_lookup(tables::SESSIONS, "abc", 5))
            .unwrap();
        assert_eq!(
            store.view(|tx| tx.lookup(tables::SESSIONS, "abc")).unwrap(),
            Some(5)
        );
        assert!(store.update(|tx| tx.remove_lookup(tables::SESSIONS, "abc")).unwrap());
        assert_eq!(store.view(|tx| tx.lookup(tables::SESSIONS, "abc")).unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_blocking_commits() {
        let (_dir, store) = test_store();

        store
            .update_blocking(|tx| tx.put(&Note { id: 4, body: "async".into() }))
            .await
            .unwrap();

        let found: Option<Note> = store.view_blocking(|tx| tx.get(4)).await.unwrap();
        assert_eq!(found.unwrap().body, "async");
    }
}
