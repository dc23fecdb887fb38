//! Policy decision engine
//!
//! Loads policy scripts from disk through a freshness-windowed file
//! cache, compiles them (top level executed once, globals frozen), keeps
//! compiled contexts in a lazy worker pool, and evaluates the script's
//! `authorize()` function per request. Workers are single-tenant and
//! version-tagged; a source change drains stale workers as they cycle
//! through the pool.

mod ast;
mod interp;
mod lexer;
mod parser;
mod value;

pub use interp::EvalError;
pub use lexer::SyntaxError;
pub use value::Value;

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::config::PolicyConfig;
use crate::error::GatewayError;

/// Errors out of the engine
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy {0:?} does not exist")]
    NotFound(String),

    #[error("policy name {0:?} is not a plain name")]
    BadName(String),

    #[error("policy source is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("policy does not parse: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("policy defines no authorize() function")]
    MissingAuthorize,

    #[error("authorize() must take no parameters")]
    AuthorizeArity,

    #[error("policy evaluation failed: {0}")]
    Runtime(#[from] EvalError),

    #[error("authorize() returned {0}, expected a bool")]
    NotBool(&'static str),

    #[error("policy I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PolicyError> for GatewayError {
    fn from(e: PolicyError) -> Self {
        match e {
            // A failing rule rejects the request; the author sees the
            // backtrace in the logs, the caller sees not-authorized.
            PolicyError::Runtime(ref err) => {
                tracing::error!("policy runtime error:\n{err}");
                GatewayError::NotAuthorized("policy evaluation failed".into())
            }
            PolicyError::NotBool(ty) => {
                tracing::error!("policy returned {ty} instead of a bool");
                GatewayError::NotAuthorized("policy returned a non-boolean".into())
            }
            PolicyError::BadName(name) => {
                GatewayError::BadRequest(format!("bad policy name {name:?}"))
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

/// A compiled, reusable evaluation context
///
/// Never shared concurrently: the pool hands a worker to exactly one call
/// at a time.
struct Worker {
    version: u64,
    globals: Arc<HashMap<String, Value>>,
    authorize: Arc<value::FuncDef>,
}

struct FileEntry {
    bytes: Arc<Vec<u8>>,
    loaded_at: Instant,
    mod_time: SystemTime,
    version: u64,
}

/// The engine; cheap to share behind an `Arc`
pub struct PolicyEngine {
    dir: PathBuf,
    freshness: Duration,
    max_source_bytes: u64,
    max_idle_workers: usize,
    files: RwLock<HashMap<String, FileEntry>>,
    pool: Mutex<Vec<Worker>>,
}

impl PolicyEngine {
    pub fn new(config: &PolicyConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self {
            dir: config.dir.clone(),
            freshness: Duration::from_secs(config.freshness_secs),
            max_source_bytes: config.max_source_bytes,
            max_idle_workers: config.max_idle_workers,
            files: RwLock::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
        })
    }

    /// Evaluate `authorize()` of the named policy against an input tree
    pub fn decide(&self, name: &str, input: serde_json::Value) -> Result<bool, PolicyError> {
        let (bytes, version) = self.load(name)?;

        let worker = match self.take_worker(version) {
            Some(worker) => worker,
            None => self.compile(&bytes, version)?,
        };

        let input = Value::from_json_owned(input);
        let result = interp::call(&worker.globals, &worker.authorize, Vec::new(), &input);

        // Evaluation leaves no state behind in the worker; it goes back
        // to the pool even when the call failed.
        self.put_worker(worker);

        match result? {
            Value::Bool(verdict) => Ok(verdict),
            other => Err(PolicyError::NotBool(other.type_name())),
        }
    }

    /// Current source of the named policy
    pub fn get_policy(&self, name: &str) -> Result<Vec<u8>, PolicyError> {
        let (bytes, _) = self.load(name)?;
        Ok(bytes.as_ref().clone())
    }

    /// Atomically replace the named policy's source
    ///
    /// The write is durable before returning; the file cache entry is
    /// invalidated so the next evaluation sees the new source.
    pub fn put_policy(&self, name: &str, bytes: &[u8]) -> Result<(), PolicyError> {
        validate_name(name)?;
        if bytes.len() as u64 > self.max_source_bytes {
            return Err(PolicyError::TooLarge {
                size: bytes.len() as u64,
                max: self.max_source_bytes,
            });
        }

        let path = self.path_of(name);
        let tmp = path.with_extension("star.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        self.files
            .write()
            .expect("policy file cache lock poisoned")
            .remove(name);
        tracing::info!(policy = name, bytes = bytes.len(), "policy source replaced");
        Ok(())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.star"))
    }

    /// Fetch source bytes through the file cache
    ///
    /// Within the freshness window the cached entry is served without
    /// touching the filesystem; after it, the modification time decides
    /// between a cheap revalidation and a reread.
    fn load(&self, name: &str) -> Result<(Arc<Vec<u8>>, u64), PolicyError> {
        validate_name(name)?;

        {
            let files = self.files.read().expect("policy file cache lock poisoned");
            if let Some(entry) = files.get(name) {
                if entry.loaded_at.elapsed() < self.freshness {
                    return Ok((entry.bytes.clone(), entry.version));
                }
            }
        }

        let path = self.path_of(name);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PolicyError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.len() > self.max_source_bytes {
            return Err(PolicyError::TooLarge {
                size: meta.len(),
                max: self.max_source_bytes,
            });
        }
        let mod_time = meta.modified()?;

        let mut files = self.files.write().expect("policy file cache lock poisoned");
        if let Some(entry) = files.get_mut(name) {
            if entry.mod_time == mod_time {
                entry.loaded_at = Instant::now();
                return Ok((entry.bytes.clone(), entry.version));
            }
        }

        let bytes = Arc::new(fs::read(&path)?);
        let version = source_version(&bytes);
        tracing::debug!(policy = name, version, "policy source (re)loaded");
        files.insert(
            name.to_string(),
            FileEntry {
                bytes: bytes.clone(),
                loaded_at: Instant::now(),
                mod_time,
                version,
            },
        );
        Ok((bytes, version))
    }

    /// Compile a source into a fresh worker
    fn compile(&self, bytes: &[u8], version: u64) -> Result<Worker, PolicyError> {
        let source = std::str::from_utf8(bytes)
            .map_err(|_| SyntaxError::new("policy source is not UTF-8", 0))?;
        let script = parser::parse(source)?;

        // Top level runs once with an empty pre-declared input; the
        // resulting globals are frozen for the worker's lifetime.
        let empty = Value::from_json(&serde_json::Value::Object(Default::default()));
        let globals = interp::exec_module(&script, &empty)?;

        let authorize = match globals.get("authorize") {
            Some(Value::Func(func)) => func.clone(),
            Some(_) | None => return Err(PolicyError::MissingAuthorize),
        };
        if !authorize.params.is_empty() {
            return Err(PolicyError::AuthorizeArity);
        }

        Ok(Worker {
            version,
            globals: Arc::new(globals),
            authorize,
        })
    }

    /// Pop an idle worker for this source version, dropping stale ones
    fn take_worker(&self, version: u64) -> Option<Worker> {
        let mut pool = self.pool.lock().expect("worker pool lock poisoned");
        while let Some(worker) = pool.pop() {
            if worker.version == version {
                return Some(worker);
            }
            // Compiled against an older source; drained here.
        }
        None
    }

    fn put_worker(&self, worker: Worker) {
        let mut pool = self.pool.lock().expect("worker pool lock poisoned");
        if pool.len() < self.max_idle_workers {
            pool.push(worker);
        }
    }

    #[cfg(test)]
    fn idle_workers(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}

/// Policy names map straight onto file names; keep them plain
fn validate_name(name: &str) -> Result<(), PolicyError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PolicyError::BadName(name.to_string()))
    }
}

/// Version tag of a source: the first 8 bytes of its SHA-256
fn source_version(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
