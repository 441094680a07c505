//! Operator-facing diagnostic endpoints.
//!
//! Each controller instance publishes a directory with two endpoints:
//!
//! - `regdump` (read-only): the register dump.
//! - `testmode` (read/write): write a command, read back the selected test modes.
//!
//! How directories and files are actually exposed (debugfs, a FUSE mount, a
//! socket) is up to the [`EndpointHost`]. [`MemoryHost`] keeps them in-process.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use embedded_hal::delay::DelayNs;
use tracing::{debug, warn};

use crate::Error;
use crate::controller::Controller;
use crate::io::RegisterIo;
use crate::testmode::CommandBuffer;

/// Default directory name for a controller's endpoints.
pub const DEFAULT_ROOT: &str = "musbfsh";

/// The two endpoints published for each controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Endpoint {
    /// Register dump.
    RegDump,
    /// Test-mode control.
    TestMode,
}

impl Endpoint {
    /// File name of the endpoint inside the instance directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Endpoint::RegDump => "regdump",
            Endpoint::TestMode => "testmode",
        }
    }

    /// Unix permission bits the endpoint is created with.
    pub fn mode(self) -> u32 {
        match self {
            Endpoint::RegDump => 0o444,
            Endpoint::TestMode => 0o644,
        }
    }

    /// Look up an endpoint by file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        [Endpoint::RegDump, Endpoint::TestMode]
            .into_iter()
            .find(|endpoint| endpoint.file_name() == name)
    }
}

/// Creates and removes the objects that expose the endpoints to an operator.
pub trait EndpointHost {
    /// Identifies a created directory.
    type Dir: Copy + std::fmt::Debug;

    /// Create a directory at the host's diagnostic root.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfResources`] if the directory cannot be allocated, or
    /// [`Error::AlreadyExists`] if the name is taken.
    fn create_dir(&mut self, name: &str) -> Result<Self::Dir, Error>;

    /// Create an endpoint file inside `dir`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfResources`] if the file cannot be allocated.
    fn create_file(&mut self, dir: Self::Dir, endpoint: Endpoint) -> Result<(), Error>;

    /// Remove `dir` and everything in it. Removing an unknown directory does nothing.
    fn remove_recursive(&mut self, dir: Self::Dir);
}

/// Published endpoints of one controller instance.
///
/// Returned by [`DiagnosticSurface::init`] and consumed by
/// [`DiagnosticSurface::teardown`]. Several surfaces, one per controller, can
/// share a host as long as their directory names differ.
#[derive(Debug)]
pub struct DiagnosticSurface<D, R> {
    dir: D,
    name: String,
    controller: Arc<Controller<R>>,
}

impl<D: Copy + std::fmt::Debug, R: RegisterIo> DiagnosticSurface<D, R> {
    /// Publish the `regdump` and `testmode` endpoints for `controller` under a
    /// directory called `name`.
    ///
    /// # Errors
    ///
    /// If any object cannot be created, everything created so far is removed and
    /// the host's error is returned.
    pub fn init<H>(host: &mut H, name: &str, controller: Arc<Controller<R>>) -> Result<Self, Error>
    where
        H: EndpointHost<Dir = D>,
    {
        debug!(name, "creating diagnostic endpoints");
        let dir = host.create_dir(name)?;
        for endpoint in [Endpoint::RegDump, Endpoint::TestMode] {
            if let Err(e) = host.create_file(dir, endpoint) {
                warn!(name, endpoint = endpoint.file_name(), "endpoint creation failed: {e}");
                host.remove_recursive(dir);
                return Err(e);
            }
        }
        Ok(Self {
            dir,
            name: name.to_owned(),
            controller,
        })
    }

    /// Remove this instance's endpoints from `host`.
    pub fn teardown<H>(self, host: &mut H)
    where
        H: EndpointHost<Dir = D>,
    {
        debug!(name = %self.name, "removing diagnostic endpoints");
        host.remove_recursive(self.dir);
    }

    /// Directory name the endpoints were published under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller served by these endpoints.
    pub fn controller(&self) -> &Arc<Controller<R>> {
        &self.controller
    }

    /// Operator read of `endpoint`.
    pub fn read(&self, endpoint: Endpoint) -> Result<String, Error> {
        match endpoint {
            Endpoint::RegDump => Ok(self.controller.register_dump()?.to_string()),
            Endpoint::TestMode => Ok(self.controller.test_mode_read()?.to_string()),
        }
    }

    /// Operator write to `endpoint`, blocking until the command is done.
    ///
    /// At most [`MAX_COMMAND_LEN`] bytes are read from `input`. The rest is left
    /// unread. Returns the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// [`Error::ReadOnlyEndpoint`] for `regdump`, [`Error::InputFault`] if `input`
    /// cannot be read, otherwise any error from [`Controller::test_mode_write`].
    ///
    /// [`MAX_COMMAND_LEN`]: crate::testmode::MAX_COMMAND_LEN
    pub fn write(&self, endpoint: Endpoint, input: impl Read, delay: impl DelayNs) -> Result<usize, Error> {
        match endpoint {
            Endpoint::RegDump => Err(Error::ReadOnlyEndpoint(endpoint.file_name())),
            Endpoint::TestMode => {
                let command = CommandBuffer::read_from(input)?;
                self.controller.test_mode_write(command.as_bytes(), delay)?;
                Ok(command.as_bytes().len())
            }
        }
    }

    /// Operator read by file name.
    pub fn read_named(&self, file_name: &str) -> Result<String, Error> {
        self.read(lookup(file_name)?)
    }

    /// Operator write by file name.
    pub fn write_named(&self, file_name: &str, input: impl Read, delay: impl DelayNs) -> Result<usize, Error> {
        self.write(lookup(file_name)?, input, delay)
    }
}

fn lookup(file_name: &str) -> Result<Endpoint, Error> {
    Endpoint::from_file_name(file_name).ok_or_else(|| Error::NotFound(file_name.to_owned()))
}

/// Directory handle issued by [`MemoryHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemoryDir(u32);

/// In-process [`EndpointHost`].
///
/// Keeps a table of directories and the endpoint files inside them. A capacity can
/// be set to simulate running out of objects.
#[derive(Debug, Default)]
pub struct MemoryHost {
    dirs: BTreeMap<MemoryDir, (String, Vec<(Endpoint, u32)>)>,
    next_id: u32,
    capacity: Option<usize>,
}

impl MemoryHost {
    /// Host with no limit on the number of objects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host that fails with [`Error::OutOfResources`] once `capacity` directories
    /// and files exist.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Number of directories and files currently present.
    pub fn object_count(&self) -> usize {
        self.dirs.values().map(|(_, files)| 1 + files.len()).sum()
    }

    /// Names of the directories present, in creation order.
    pub fn dir_names(&self) -> Vec<&str> {
        self.dirs.values().map(|(name, _)| name.as_str()).collect()
    }

    /// Endpoints and their modes inside the directory called `name`.
    pub fn files_in(&self, name: &str) -> Option<&[(Endpoint, u32)]> {
        self.dirs
            .values()
            .find(|(dir_name, _)| dir_name == name)
            .map(|(_, files)| files.as_slice())
    }

    fn reserve(&self) -> Result<(), Error> {
        match self.capacity {
            Some(capacity) if self.object_count() >= capacity => Err(Error::OutOfResources),
            _ => Ok(()),
        }
    }
}

impl EndpointHost for MemoryHost {
    type Dir = MemoryDir;

    fn create_dir(&mut self, name: &str) -> Result<MemoryDir, Error> {
        if self.dirs.values().any(|(existing, _)| existing == name) {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        self.reserve()?;
        let dir = MemoryDir(self.next_id);
        self.next_id += 1;
        self.dirs.insert(dir, (name.to_owned(), Vec::new()));
        Ok(dir)
    }

    fn create_file(&mut self, dir: MemoryDir, endpoint: Endpoint) -> Result<(), Error> {
        self.reserve()?;
        let (name, files) = self
            .dirs
            .get_mut(&dir)
            .ok_or_else(|| Error::NotFound(format!("{dir:?}")))?;
        if files.iter().any(|(existing, _)| *existing == endpoint) {
            return Err(Error::AlreadyExists(format!("{name}/{}", endpoint.file_name())));
        }
        files.push((endpoint, endpoint.mode()));
        Ok(())
    }

    fn remove_recursive(&mut self, dir: MemoryDir) {
        self.dirs.remove(&dir);
    }
}
