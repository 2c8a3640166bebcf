//! Filesystem isolation of builders with Linux namespaces.
//!
//! Between fork and exec the builder enters a new user namespace (mapping
//! only the invoking uid and gid) and a new mount namespace. There it mounts
//! a tmpfs as its future root and binds into it:
//!
//! - the sandbox directory, read-write, at its usual absolute path;
//! - the system directories in [`SYSTEM_DIRS`], read-only;
//! - a handful of character devices such as `/dev/null`.
//!
//! Then it pivots into the new root and detaches the old one, so neither the
//! rest of the store nor any other host path is reachable. Everything the
//! child does is a plain syscall on data prepared before the fork.
//!
//! Kernels without unprivileged user namespaces fail [`available`] once per
//! process and builds fall back to running unisolated.

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::stat::Mode;
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, chdir, fork, getgid, getuid, mkdir, pivot_root, write};
use tracing::{debug, warn};

/// Host directories visible, read-only, to every builder.
pub const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32"];

const DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/full", "/dev/random", "/dev/urandom"];

/// Where the old root is parked until it is detached.
const OLD_ROOT: &str = ".old-root";

/// Host mount flags a read-only remount has to repeat.
const LOCKED_FLAGS: [(FsFlags, MsFlags); 6] = [
  (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
  (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
  (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
  (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
  (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
  (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
];

#[derive(Debug)]
struct Bind {
  source: CString,
  target: CString,
  read_only: bool,
}

impl Bind {
  fn apply(&self) -> nix::Result<()> {
    mount(
      Some(self.source.as_c_str()),
      self.target.as_c_str(),
      None::<&CStr>,
      MsFlags::MS_BIND | MsFlags::MS_REC,
      None::<&CStr>,
    )?;
    if !self.read_only {
      return Ok(());
    }

    // MS_RDONLY is ignored on the initial bind; it takes a remount.
    let host = statvfs(self.source.as_c_str())?.flags();
    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
    for (fs_flag, ms_flag) in LOCKED_FLAGS {
      if host.contains(fs_flag) {
        flags |= ms_flag;
      }
    }
    mount(None::<&CStr>, self.target.as_c_str(), None::<&CStr>, flags, None::<&CStr>)
  }
}

/// Everything a builder needs to isolate itself, computed in the parent.
#[derive(Debug)]
pub struct Plan {
  new_root: CString,
  old_root: CString,
  old_root_inside: CString,
  workdir: CString,
  uid_map: Vec<u8>,
  gid_map: Vec<u8>,
  /// Parents before children.
  dirs: Vec<CString>,
  /// Empty files to bind devices onto.
  files: Vec<CString>,
  binds: Vec<Bind>,
}

impl Plan {
  /// Isolate a builder working in `sandbox`, building its root on the empty
  /// directory `new_root`. Both paths must be absolute.
  pub fn new(sandbox: &Path, new_root: &Path) -> io::Result<Self> {
    if !sandbox.is_absolute() || !new_root.is_absolute() {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "sandbox and root must be absolute paths",
      ));
    }
    let inside = |path: &Path| new_root.join(path.strip_prefix("/").unwrap_or(path));

    let mut dirs = BTreeSet::new();
    let mut files = Vec::new();
    let mut binds = Vec::new();

    for dir in SYSTEM_DIRS.iter().map(Path::new).filter(|dir| dir.is_dir()) {
      add_with_parents(&mut dirs, new_root, dir);
      binds.push(bind(dir, &inside(dir), true)?);
    }

    add_with_parents(&mut dirs, new_root, sandbox);
    binds.push(bind(sandbox, &inside(sandbox), false)?);

    for device in DEVICES.iter().map(Path::new).filter(|device| device.exists()) {
      if let Some(parent) = device.parent() {
        add_with_parents(&mut dirs, new_root, parent);
      }
      files.push(c_path(&inside(device))?);
      binds.push(bind(device, &inside(device), false)?);
    }

    let old_root = new_root.join(OLD_ROOT);
    dirs.insert(old_root.clone());

    Ok(Self {
      new_root: c_path(new_root)?,
      old_root: c_path(&old_root)?,
      old_root_inside: c_path(&Path::new("/").join(OLD_ROOT))?,
      workdir: c_path(sandbox)?,
      uid_map: format!("{} {} 1\n", getuid(), getuid()).into_bytes(),
      gid_map: format!("{} {} 1\n", getgid(), getgid()).into_bytes(),
      dirs: dirs.iter().map(|dir| c_path(dir)).collect::<io::Result<_>>()?,
      files,
      binds,
    })
  }

  /// Enter the namespaces and switch to the prepared root. Runs in the
  /// child between fork and exec: no allocation, no locks.
  pub fn enter(&self) -> io::Result<()> {
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)?;
    write_file(c"/proc/self/setgroups", b"deny")?;
    write_file(c"/proc/self/uid_map", &self.uid_map)?;
    write_file(c"/proc/self/gid_map", &self.gid_map)?;

    // Nothing mounted from here on may leak back to the host.
    mount(
      None::<&CStr>,
      c"/",
      None::<&CStr>,
      MsFlags::MS_REC | MsFlags::MS_PRIVATE,
      None::<&CStr>,
    )?;
    mount(
      Some(c"tmpfs"),
      self.new_root.as_c_str(),
      Some(c"tmpfs"),
      MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
      Some(c"mode=0755"),
    )?;

    for dir in &self.dirs {
      match mkdir(dir.as_c_str(), Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(e.into()),
      }
    }
    for file in &self.files {
      open(
        file.as_c_str(),
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
      )?;
    }
    for bind in &self.binds {
      bind.apply()?;
    }

    pivot_root(self.new_root.as_c_str(), self.old_root.as_c_str())?;
    chdir(c"/")?;
    umount2(self.old_root_inside.as_c_str(), MntFlags::MNT_DETACH)?;
    mount(
      None::<&CStr>,
      c"/",
      None::<&CStr>,
      MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
      None::<&CStr>,
    )?;
    chdir(self.workdir.as_c_str())?;
    Ok(())
  }
}

fn bind(source: &Path, target: &Path, read_only: bool) -> io::Result<Bind> {
  Ok(Bind {
    source: c_path(source)?,
    target: c_path(target)?,
    read_only,
  })
}

fn add_with_parents(dirs: &mut BTreeSet<PathBuf>, new_root: &Path, path: &Path) {
  for ancestor in path.ancestors() {
    if let Ok(relative) = ancestor.strip_prefix("/")
      && !relative.as_os_str().is_empty()
    {
      dirs.insert(new_root.join(relative));
    }
  }
}

fn c_path(path: &Path) -> io::Result<CString> {
  CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn write_file(path: &CStr, data: &[u8]) -> nix::Result<()> {
  let fd = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
  write(&fd, data)?;
  Ok(())
}

/// Whether builders can be isolated here. Checked once per process by
/// isolating a throwaway child.
pub fn available() -> bool {
  static AVAILABLE: OnceLock<bool> = OnceLock::new();
  *AVAILABLE.get_or_init(|| match try_isolation() {
    Ok(()) => {
      debug!("builders run in private user and mount namespaces");
      true
    }
    Err(e) => {
      warn!(error = %e, "cannot create user namespaces, builds can read the whole filesystem");
      false
    }
  })
}

fn try_isolation() -> io::Result<()> {
  let sandbox = tempfile::tempdir()?;
  let new_root = tempfile::tempdir()?;
  let plan = Plan::new(
    &dunce::canonicalize(sandbox.path())?,
    &dunce::canonicalize(new_root.path())?,
  )?;

  // SAFETY: the child only makes syscalls on memory prepared above, then exits.
  match unsafe { fork() }? {
    ForkResult::Child => {
      let code = match plan.enter() {
        Ok(()) => 0,
        Err(e) => e.raw_os_error().unwrap_or(255),
      };
      // SAFETY: _exit skips destructors that belong to the parent.
      unsafe { nix::libc::_exit(code) }
    }
    ForkResult::Parent { child } => match waitpid(child, None)? {
      WaitStatus::Exited(_, 0) => Ok(()),
      WaitStatus::Exited(_, code) => Err(io::Error::from_raw_os_error(code)),
      status => Err(io::Error::other(format!("isolated test child ended with {:?}", status))),
    },
  }
}
