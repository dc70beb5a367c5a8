//! Unix Named Objects - Owner-Restricted Directories and `flock` Locks
//!
//! A secured namespace is a directory `<root>/<name>.ns` with mode `0700`,
//! owned by the boundary's principal and carrying a `.boundary` marker that
//! records the boundary name and principal. A named mutex is a lock file
//! inside it, owned through `flock(2)`.
//!
//! # Security Model:
//! ```text
//! <root>/                                 0700, uid == principal
//!   ├── .Wintun.ns.lock                   entry lock, 0600
//!   └── Wintun.ns/                        0700, uid == principal
//!        ├── .boundary                    "Wintun\n0\n"
//!        ├── Wintun-Driver-Installation-Mutex.lock
//!        └── Wintun-Name-Mutex-<hex>.lock 0600
//! ```
//!
//! The root is created on first use and refused unless it belongs to the
//! principal and nobody else can write to it. Every entry under it is
//! therefore placed by the principal, so no other user can squat a
//! namespace name ahead of the legitimate owner. A namespace whose
//! ownership or marker does not match is refused rather than joined.
//!
//! # Creation Race:
//! The namespace is assembled in a private staging directory and moved
//! into place with a single `rename(2)`. Teardown moves it aside the same
//! way before deleting it. Both hold the entry lock, so the namespace path
//! only ever holds a complete namespace. Losing the publishing rename
//! surfaces as `AlreadyExists`; a namespace retired between create and
//! open surfaces as `PathNotFound`, which the runtime retries. Any other
//! failure, staging included, is reported as `Os` and ends the bootstrap.
//!
//! A directory found without its marker can only be the remains of an
//! interrupted teardown; it is retired on sight and reported as
//! `PathNotFound` so the runtime recreates the namespace.
//!
//! # Abandonment:
//! `flock` locks die with their open file description, so an owner that
//! exits without releasing frees the lock. The owner's pid is written into
//! the lock file on acquisition and cleared on release; finding it still
//! present after acquiring means the previous owner abandoned the mutex.

use super::{BoundaryDescriptor, NamespacePlatform, PlatformResult, WaitOutcome};
use crate::error::SystemError;
use crate::naming::ObjectName;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg, OFlag};
use nix::sys::stat::Mode;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Marker file recording the boundary of a namespace directory.
const BOUNDARY_FILE: &str = ".boundary";

/// Extension of namespace directories.
const NAMESPACE_EXT: &str = "ns";

/// Extension of mutex lock files and namespace entry locks.
const LOCK_EXT: &str = "lock";

/// Scratch names tried before staging or retiring gives up.
const SCRATCH_ATTEMPTS: u32 = 64;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A named mutex backed by a lock file.
#[derive(Debug)]
pub struct UnixMutex {
    file: File,
    path: PathBuf,
}

impl UnixMutex {
    /// Path of the backing lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Named objects on a Unix filesystem.
#[derive(Debug, Clone)]
pub struct UnixPlatform {
    root: PathBuf,
}

impl UnixPlatform {
    /// Create a platform rooted at `root`.
    ///
    /// The root's parent must exist. The root itself is created with mode
    /// `0700` by the first namespace creation, and must be owned by the
    /// boundary principal without group or other write access.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every namespace of this platform.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing the namespace called `name`.
    pub fn namespace_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{NAMESPACE_EXT}"))
    }

    /// Remove a namespace and every object in it.
    ///
    /// The directory is first moved aside in one `rename(2)`, so the
    /// namespace path never holds a half-removed namespace even if this
    /// process dies while deleting.
    pub fn remove_namespace(&self, name: &str) -> PlatformResult<()> {
        validate_component(name)?;
        let _entry = self.lock_entry(name)?;
        let retired = self.retire(name)?;
        fs::remove_dir_all(&retired).map_err(unexpected)?;
        debug!(namespace = name, "Removed namespace directory");
        Ok(())
    }

    fn lock_path(&self, name: &ObjectName) -> PlatformResult<PathBuf> {
        validate_component(name.namespace())?;
        validate_component(name.object())?;
        Ok(self
            .namespace_dir(name.namespace())
            .join(format!("{}.{LOCK_EXT}", name.object())))
    }

    fn scratch_path(&self, name: &str) -> PathBuf {
        let seq = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!(".{name}.{NAMESPACE_EXT}.{}.{seq}", std::process::id()))
    }

    /// Create the root if missing, then check it.
    fn prepare_root(&self, boundary: &BoundaryDescriptor) -> PlatformResult<()> {
        match nix::unistd::mkdir(&self.root, Mode::S_IRWXU) {
            Ok(()) => debug!(root = %self.root.display(), "Created namespace root"),
            Err(Errno::EEXIST) => {}
            Err(e) => return Err(unexpected(e)),
        }
        self.check_root(boundary)
    }

    fn check_root(&self, boundary: &BoundaryDescriptor) -> PlatformResult<()> {
        let meta = fs::symlink_metadata(&self.root).map_err(unexpected)?;
        if !meta.is_dir() || meta.uid() != boundary.principal().uid() || meta.mode() & 0o022 != 0 {
            warn!(
                root = %self.root.display(),
                owner = meta.uid(),
                mode = %format!("{:o}", meta.mode() & 0o7777),
                "Namespace root is not private to the boundary principal"
            );
            return Err(SystemError::AccessDenied);
        }
        Ok(())
    }

    /// Serializes publishing, retiring and reclaiming the namespace path.
    /// Held until the returned file is dropped.
    fn lock_entry(&self, name: &str) -> PlatformResult<File> {
        let path = self.root.join(format!(".{name}.{NAMESPACE_EXT}.{LOCK_EXT}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .open(&path)
            .map_err(unexpected)?;
        lock_exclusive(&file).map_err(unexpected)?;
        Ok(file)
    }

    /// Assemble a complete namespace under a fresh scratch name.
    fn stage(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<PathBuf> {
        for _ in 0..SCRATCH_ATTEMPTS {
            let staging = self.scratch_path(name);
            match nix::unistd::mkdir(&staging, Mode::S_IRWXU) {
                Ok(()) => {}
                Err(Errno::EEXIST) => continue,
                Err(e) => return Err(unexpected(e)),
            }
            if let Err(e) = write_marker(&staging, boundary) {
                let _ = fs::remove_dir_all(&staging);
                return Err(unexpected(e));
            }
            return Ok(staging);
        }
        Err(no_scratch_name(name))
    }

    /// Move the namespace directory to a fresh scratch name. Entry lock held.
    fn retire(&self, name: &str) -> PlatformResult<PathBuf> {
        let dir = self.namespace_dir(name);
        for _ in 0..SCRATCH_ATTEMPTS {
            let retired = self.scratch_path(name);
            if fs::symlink_metadata(&retired).is_ok() {
                continue;
            }
            return match fs::rename(&dir, &retired) {
                Ok(()) => Ok(retired),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(SystemError::PathNotFound),
                Err(e) => Err(unexpected(e)),
            };
        }
        Err(no_scratch_name(name))
    }

    /// Retire a namespace directory that has no marker.
    fn reclaim(&self, name: &str) -> PlatformResult<()> {
        let _entry = self.lock_entry(name)?;
        match fs::symlink_metadata(self.namespace_dir(name).join(BOUNDARY_FILE)) {
            // Republished since the caller looked
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(unexpected(e)),
        }

        let retired = match self.retire(name) {
            Ok(retired) => retired,
            Err(SystemError::PathNotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        warn!(namespace = name, "Reclaimed namespace directory left without boundary marker");
        if let Err(e) = fs::remove_dir_all(&retired) {
            warn!(path = %retired.display(), error = %e, "Failed to delete reclaimed namespace");
        }
        Ok(())
    }
}

/// Object names become single path components.
fn validate_component(component: &str) -> PlatformResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\0')
    {
        return Err(SystemError::Os {
            code: Errno::EINVAL as i32,
            message: format!("invalid object name component {component:?}"),
        });
    }
    Ok(())
}

/// Failures outside the create/open handshake must not read as its
/// `AlreadyExists` or `PathNotFound` outcomes.
fn unexpected(err: impl Into<SystemError>) -> SystemError {
    match err.into() {
        e @ (SystemError::AlreadyExists | SystemError::PathNotFound) => SystemError::Os {
            code: e.code(),
            message: e.to_string(),
        },
        e => e,
    }
}

fn no_scratch_name(name: &str) -> SystemError {
    SystemError::Os {
        code: Errno::EEXIST as i32,
        message: format!("no free scratch name for namespace {name:?}"),
    }
}

fn lock_exclusive(file: &File) -> nix::Result<()> {
    loop {
        match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

fn boundary_marker(boundary: &BoundaryDescriptor) -> String {
    format!("{}\n{}\n", boundary.name(), boundary.principal().uid())
}

fn write_marker(dir: &Path, boundary: &BoundaryDescriptor) -> std::io::Result<()> {
    let mut marker = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dir.join(BOUNDARY_FILE))?;
    marker.write_all(boundary_marker(boundary).as_bytes())
}

impl NamespacePlatform for UnixPlatform {
    type Mutex = UnixMutex;

    fn create_namespace(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<()> {
        validate_component(name)?;
        if nix::unistd::geteuid().as_raw() != boundary.principal().uid() {
            return Err(SystemError::AccessDenied);
        }
        self.prepare_root(boundary)?;

        let _entry = self.lock_entry(name)?;
        let staging = self.stage(boundary, name)?;
        match fs::rename(&staging, self.namespace_dir(name)) {
            Ok(()) => {
                debug!(namespace = name, boundary = boundary.name(), "Created namespace directory");
                Ok(())
            }
            Err(e) => {
                // Nothing else can see the staging directory; best effort.
                let _ = fs::remove_dir_all(&staging);
                Err(e.into())
            }
        }
    }

    fn open_namespace(&self, boundary: &BoundaryDescriptor, name: &str) -> PlatformResult<()> {
        validate_component(name)?;
        self.check_root(boundary)?;
        let dir = self.namespace_dir(name);

        let meta = fs::symlink_metadata(&dir)?;
        if !meta.is_dir() {
            return Err(SystemError::AccessDenied);
        }
        if meta.uid() != boundary.principal().uid() || meta.mode() & 0o077 != 0 {
            warn!(
                namespace = name,
                owner = meta.uid(),
                mode = %format!("{:o}", meta.mode() & 0o7777),
                "Namespace directory ownership does not match boundary"
            );
            return Err(SystemError::AccessDenied);
        }

        match fs::read_to_string(dir.join(BOUNDARY_FILE)) {
            Ok(marker) if marker == boundary_marker(boundary) => Ok(()),
            Ok(_) => Err(SystemError::AccessDenied),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.reclaim(name)?;
                Err(SystemError::PathNotFound)
            }
            Err(e) => Err(unexpected(e)),
        }
    }

    fn create_or_open_mutex(&self, name: &ObjectName) -> PlatformResult<Self::Mutex> {
        let path = self.lock_path(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .open(&path)?;
        Ok(UnixMutex { file, path })
    }

    fn wait_acquire(&self, mutex: &Self::Mutex) -> PlatformResult<WaitOutcome> {
        lock_exclusive(&mutex.file)?;

        let mut file = &mutex.file;
        let mut previous = String::new();
        let stamped = file
            .seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut previous))
            .and_then(|_| file.set_len(0))
            .and_then(|()| file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(file, "{}", std::process::id()));
        if let Err(e) = stamped {
            let _ = flock(mutex.file.as_raw_fd(), FlockArg::Unlock);
            return Err(e.into());
        }

        if previous.trim().is_empty() {
            Ok(WaitOutcome::Acquired)
        } else {
            debug!(path = %mutex.path.display(), previous_owner = previous.trim(), "Lock file still stamped");
            Ok(WaitOutcome::Abandoned)
        }
    }

    fn release(&self, mutex: Self::Mutex) {
        if let Err(e) = mutex.file.set_len(0) {
            warn!(path = %mutex.path.display(), error = %e, "Failed to clear owner stamp");
        }
        if let Err(e) = flock(mutex.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %mutex.path.display(), error = %e, "Failed to unlock");
        }
    }
}
