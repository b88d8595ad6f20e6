//! Binds the VFS node graph onto the `nfsserve` filesystem trait.
//!
//! The wire protocol addresses files by `fileid3`, so the adapter interns
//! paths into a bidirectional id table. Engine calls are synchronous and run
//! on the blocking pool; NFSv3 reads are stateless, so materialized payloads
//! are kept in a small insertion-ordered table per file id — a read at
//! offset 0 re-materializes, later offsets serve from the table. Everything
//! outside `/_queries` is read-only.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use aplfs_core::query::ResultPayload;
use aplfs_core::vfs::PLACEHOLDER_SIZE;
use aplfs_core::{Error, FileAttr, Node, Vfs};

use nfsserve::nfs::{
    fattr3, fileid3, filename3, ftype3, nfspath3, nfsstat3, nfstime3, sattr3, set_size3, specdata3,
};
use nfsserve::vfs::{DirEntry, NFSFileSystem, ReadDirResult, VFSCapabilities};

const ROOT_ID: fileid3 = 1;
/// Cached payloads kept per adapter; oldest are dropped first, which also
/// unlinks any spill file once the last reference goes away.
const MAX_CACHED_PAYLOADS: usize = 64;

pub struct AplFs {
    vfs: Arc<Vfs>,
    state: Mutex<State>,
}

struct State {
    paths: Vec<String>,
    ids: HashMap<String, fileid3>,
    sizes: HashMap<fileid3, u64>,
    payloads: HashMap<fileid3, ResultPayload>,
    payload_order: VecDeque<fileid3>,
}

impl AplFs {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        let mut state = State {
            paths: Vec::new(),
            ids: HashMap::new(),
            sizes: HashMap::new(),
            payloads: HashMap::new(),
            payload_order: VecDeque::new(),
        };
        state.paths.push(String::new());
        state.ids.insert(String::new(), ROOT_ID);
        Self {
            vfs,
            state: Mutex::new(state),
        }
    }

    fn intern(&self, path: &str) -> fileid3 {
        let mut state = self.state.lock();
        if let Some(id) = state.ids.get(path) {
            return *id;
        }
        state.paths.push(path.to_string());
        let id = state.paths.len() as fileid3;
        state.ids.insert(path.to_string(), id);
        id
    }

    fn path_of(&self, id: fileid3) -> Result<String, nfsstat3> {
        let state = self.state.lock();
        state
            .paths
            .get((id as usize).wrapping_sub(1))
            .cloned()
            .ok_or(nfsstat3::NFS3ERR_STALE)
    }

    fn cached_size(&self, id: fileid3) -> Option<u64> {
        self.state.lock().sizes.get(&id).copied()
    }

    fn cache_payload(&self, id: fileid3, payload: &ResultPayload) {
        let mut state = self.state.lock();
        state.sizes.insert(id, payload.len());
        if state.payloads.insert(id, payload.clone()).is_none() {
            state.payload_order.push_back(id);
        }
        while state.payloads.len() > MAX_CACHED_PAYLOADS {
            let Some(oldest) = state.payload_order.pop_front() else {
                break;
            };
            state.payloads.remove(&oldest);
        }
    }

    fn cached_payload(&self, id: fileid3) -> Option<ResultPayload> {
        self.state.lock().payloads.get(&id).cloned()
    }

    /// Drops the cached payload and size for a file whose content just
    /// changed, so the next read re-materializes instead of serving the
    /// pre-write bytes.
    fn invalidate(&self, id: fileid3) {
        let mut state = self.state.lock();
        state.payloads.remove(&id);
        state.payload_order.retain(|cached| *cached != id);
        state.sizes.remove(&id);
    }

    async fn resolve(&self, id: fileid3) -> Result<Node, nfsstat3> {
        let path = self.path_of(id)?;
        let vfs = Arc::clone(&self.vfs);
        run_blocking(move || resolve_path(&vfs, &path)).await
    }

    fn attr(&self, id: fileid3, attr: &FileAttr) -> fattr3 {
        let mut size = attr.size;
        if !attr.is_dir && size == PLACEHOLDER_SIZE {
            if let Some(cached) = self.cached_size(id) {
                size = cached;
            }
        }
        let time = nfs_time(attr.mtime);
        let (ftype, mode, nlink) = if attr.is_dir {
            (ftype3::NF3DIR, if attr.writable { 0o755 } else { 0o555 }, 2)
        } else {
            (ftype3::NF3REG, if attr.writable { 0o644 } else { 0o444 }, 1)
        };
        fattr3 {
            ftype,
            mode,
            nlink,
            uid: 65534,
            gid: 65534,
            size,
            used: size,
            rdev: specdata3 {
                specdata1: 0,
                specdata2: 0,
            },
            fsid: 0,
            fileid: id,
            atime: time,
            mtime: time,
            ctime: time,
        }
    }

    async fn getattr_inner(&self, id: fileid3) -> Result<fattr3, nfsstat3> {
        let node = self.resolve(id).await?;
        Ok(self.attr(id, &self.vfs.stat(&node)))
    }
}

/// Walks a `/`-joined path down from the root.
fn resolve_path(vfs: &Vfs, path: &str) -> Result<Node, nfsstat3> {
    let mut node = Node::Root;
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if !node.is_dir() {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        node = vfs.lookup(&node, segment).map_err(map_error)?;
    }
    Ok(node)
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn parent_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

fn map_error(err: Error) -> nfsstat3 {
    match err {
        Error::NotFound => nfsstat3::NFS3ERR_NOENT,
        Error::ReadOnly => nfsstat3::NFS3ERR_ROFS,
        Error::Compile(_) | Error::Invalid(_) | Error::Config(_) => nfsstat3::NFS3ERR_INVAL,
        Error::Upstream(_) | Error::Auth(_) | Error::Io(_) | Error::Json(_) => {
            nfsstat3::NFS3ERR_IO
        }
    }
}

fn nfs_time(time: SystemTime) -> nfstime3 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    nfstime3 {
        seconds: since_epoch.as_secs() as u32,
        nseconds: since_epoch.subsec_nanos(),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, nfsstat3>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, nfsstat3> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| nfsstat3::NFS3ERR_IO)?
}

fn name_str(filename: &filename3) -> String {
    String::from_utf8_lossy(filename.as_ref()).into_owned()
}

#[async_trait]
impl NFSFileSystem for AplFs {
    fn root_dir(&self) -> fileid3 {
        ROOT_ID
    }

    fn capabilities(&self) -> VFSCapabilities {
        VFSCapabilities::ReadWrite
    }

    async fn lookup(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        let dir_path = self.path_of(dirid)?;
        let name = name_str(filename);
        if name == "." {
            return Ok(dirid);
        }
        if name == ".." {
            return Ok(self.intern(&parent_path(&dir_path)));
        }

        let child_path = join_path(&dir_path, &name);
        let vfs = Arc::clone(&self.vfs);
        let walk_path = child_path.clone();
        run_blocking(move || resolve_path(&vfs, &walk_path)).await?;
        Ok(self.intern(&child_path))
    }

    async fn getattr(&self, id: fileid3) -> Result<fattr3, nfsstat3> {
        self.getattr_inner(id).await
    }

    async fn setattr(&self, id: fileid3, setattr: sattr3) -> Result<fattr3, nfsstat3> {
        let node = self.resolve(id).await?;
        match node {
            Node::SlotApl { slot } => {
                if let set_size3::size(size) = setattr.size {
                    let vfs = Arc::clone(&self.vfs);
                    let slot = slot.clone();
                    run_blocking(move || vfs.resize_slot(&slot, size).map_err(map_error)).await?;
                    self.invalidate(id);
                }
                self.getattr_inner(id).await
            }
            _ => match setattr.size {
                // Mode/owner/time changes on virtual nodes are accepted and
                // ignored; size changes are real writes.
                set_size3::size(_) => Err(nfsstat3::NFS3ERR_ROFS),
                _ => self.getattr_inner(id).await,
            },
        }
    }

    async fn read(
        &self,
        id: fileid3,
        offset: u64,
        count: u32,
    ) -> Result<(Vec<u8>, bool), nfsstat3> {
        let node = self.resolve(id).await?;
        if node.is_dir() {
            return Err(nfsstat3::NFS3ERR_ISDIR);
        }

        // Offset 0 starts a fresh materialization; later offsets continue
        // from the payload produced by that first read.
        let payload = match (offset > 0).then(|| self.cached_payload(id)).flatten() {
            Some(payload) => payload,
            None => {
                let vfs = Arc::clone(&self.vfs);
                let open_node = node.clone();
                let payload =
                    run_blocking(move || vfs.open(&open_node).map_err(map_error)).await?;
                self.cache_payload(id, &payload);
                payload
            }
        };

        let len = payload.len();
        if offset >= len {
            return Ok((Vec::new(), true));
        }
        let wanted = (count as u64).min(len - offset) as usize;
        let mut buf = vec![0u8; wanted];
        let payload_for_read = payload.clone();
        let n = run_blocking(move || {
            payload_for_read
                .read_at(&mut buf, offset)
                .map(|n| {
                    buf.truncate(n);
                    buf
                })
                .map_err(map_error)
        })
        .await?;
        let eof = offset + n.len() as u64 >= len;
        Ok((n, eof))
    }

    async fn write(&self, id: fileid3, offset: u64, data: &[u8]) -> Result<fattr3, nfsstat3> {
        let node = self.resolve(id).await?;
        let Node::SlotApl { slot } = node else {
            return Err(nfsstat3::NFS3ERR_ROFS);
        };
        debug!(slot, offset, len = data.len(), "slot write");
        let vfs = Arc::clone(&self.vfs);
        let data = data.to_vec();
        let slot_name = slot.clone();
        run_blocking(move || {
            vfs.write_slot(&slot_name, offset, &data)
                .map_err(map_error)
        })
        .await?;
        self.invalidate(id);
        self.getattr_inner(id).await
    }

    async fn create(
        &self,
        dirid: fileid3,
        filename: &filename3,
        _attr: sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let dir = self.resolve(dirid).await?;
        let name = name_str(filename);
        let Node::SlotDir { .. } = dir else {
            return Err(nfsstat3::NFS3ERR_ROFS);
        };
        if name != "apl" {
            return Err(nfsstat3::NFS3ERR_ROFS);
        }
        let dir_path = self.path_of(dirid)?;
        let id = self.intern(&join_path(&dir_path, &name));
        let attr = self.getattr_inner(id).await?;
        Ok((id, attr))
    }

    async fn create_exclusive(
        &self,
        _dirid: fileid3,
        _filename: &filename3,
    ) -> Result<fileid3, nfsstat3> {
        Err(nfsstat3::NFS3ERR_NOTSUPP)
    }

    async fn mkdir(
        &self,
        dirid: fileid3,
        dirname: &filename3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let dir = self.resolve(dirid).await?;
        if dir != Node::QueriesDir {
            return Err(nfsstat3::NFS3ERR_ROFS);
        }
        let name = name_str(dirname);
        if !aplfs_core::store::is_valid_slot_name(&name) {
            return Err(nfsstat3::NFS3ERR_INVAL);
        }
        // Slot directories are virtual; they exist as soon as they are named.
        let dir_path = self.path_of(dirid)?;
        let id = self.intern(&join_path(&dir_path, &name));
        let attr = self.getattr_inner(id).await?;
        Ok((id, attr))
    }

    async fn remove(&self, _dirid: fileid3, _filename: &filename3) -> Result<(), nfsstat3> {
        Err(nfsstat3::NFS3ERR_ROFS)
    }

    async fn rename(
        &self,
        _from_dirid: fileid3,
        _from_filename: &filename3,
        _to_dirid: fileid3,
        _to_filename: &filename3,
    ) -> Result<(), nfsstat3> {
        Err(nfsstat3::NFS3ERR_ROFS)
    }

    async fn readdir(
        &self,
        dirid: fileid3,
        start_after: fileid3,
        max_entries: usize,
    ) -> Result<ReadDirResult, nfsstat3> {
        let dir = self.resolve(dirid).await?;
        if !dir.is_dir() {
            return Err(nfsstat3::NFS3ERR_NOTDIR);
        }
        let dir_path = self.path_of(dirid)?;
        let vfs = Arc::clone(&self.vfs);
        let list_dir = dir.clone();
        let children = run_blocking(move || vfs.readdir(&list_dir).map_err(map_error)).await?;

        let mut entries = Vec::new();
        for child in &children {
            let id = self.intern(&join_path(&dir_path, &child.name));
            let attr = self.attr(id, &self.vfs.stat(&child.node));
            entries.push(DirEntry {
                fileid: id,
                name: child.name.as_bytes().to_vec().into(),
                attr,
            });
        }

        let skip = if start_after == 0 {
            0
        } else {
            match entries.iter().position(|entry| entry.fileid == start_after) {
                Some(pos) => pos + 1,
                None => return Err(nfsstat3::NFS3ERR_BAD_COOKIE),
            }
        };
        let remaining: Vec<DirEntry> = entries.drain(..).skip(skip).collect();
        let end = remaining.len() <= max_entries;
        Ok(ReadDirResult {
            entries: remaining.into_iter().take(max_entries).collect(),
            end,
        })
    }

    async fn symlink(
        &self,
        _dirid: fileid3,
        _linkname: &filename3,
        _symlink: &nfspath3,
        _attr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        Err(nfsstat3::NFS3ERR_ROFS)
    }

    async fn readlink(&self, _id: fileid3) -> Result<nfspath3, nfsstat3> {
        Err(nfsstat3::NFS3ERR_NOENT)
    }
}
