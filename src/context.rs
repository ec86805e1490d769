//! The execution context.
//!
//! Options live in a thread-local [`Options`] value. [`set`] applies a batch
//! of [`Overrides`] and returns a [`Scope`] guard; dropping the guard puts the
//! previous options back verbatim, also when the scoped code returns early
//! with an error or unwinds from a panic. Scopes nest, the innermost one wins.
//!
//! The scheduler takes one snapshot at the start of a run and passes what the
//! workers need explicitly, so worker threads never read the context.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::codec::{Cbor, PayloadCodec};
use crate::error::OptionError;
use crate::value::Value;

thread_local! {
    static CURRENT: RefCell<Options> = RefCell::new(Options::default());
}

/// Maximum number of tasks bundled into one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    Fixed(NonZeroUsize),
    /// Dispatch everything that is ready in one round, split evenly across
    /// the workers.
    Unbounded,
}

impl ChunkSize {
    /// `0` means unbounded.
    pub fn fixed(size: usize) -> Self {
        NonZeroUsize::new(size).map_or(ChunkSize::Unbounded, ChunkSize::Fixed)
    }

    fn to_value(self) -> Value {
        match self {
            ChunkSize::Fixed(n) => Value::from(n.get()),
            ChunkSize::Unbounded => Value::Int(-1),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(ChunkSize::Unbounded),
            Value::Int(-1) => Some(ChunkSize::Unbounded),
            Value::Int(n) => usize::try_from(*n).ok().map(ChunkSize::fixed),
            _ => None,
        }
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::fixed(2)
    }
}

/// Effective configuration.
#[derive(Clone, Default)]
pub struct Options {
    /// Run deferred calls immediately instead of building nodes.
    pub eager: bool,
    pub chunk_size: ChunkSize,
    /// Re-execute a failed task on the controller before giving up.
    pub rerun_on_failure: bool,
    /// `None` uses the available hardware parallelism.
    pub workers: Option<NonZeroUsize>,
    /// `None` uses [`Cbor`].
    pub codec: Option<Arc<dyn PayloadCodec>>,
    /// Options nothing in this crate reads, kept for callers.
    pub extra: BTreeMap<String, Value>,
}

impl Options {
    /// Reads an option by name.
    pub fn get(&self, name: &str) -> Option<Value> {
        match name {
            "eager" => Some(Value::Bool(self.eager)),
            "chunk_size" | "multiprocessing.chunk_size" => Some(self.chunk_size.to_value()),
            "rerun_on_failure" | "multiprocessing.rerun_exceptions_locally" => {
                Some(Value::Bool(self.rerun_on_failure))
            }
            "workers" | "multiprocessing.num_workers" => Some(Value::from(self.workers())),
            "codec" => Some(Value::from(self.codec().name())),
            _ => self.extra.get(name).cloned(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
            .or_else(|| std::thread::available_parallelism().ok())
            .map_or(1, NonZeroUsize::get)
    }

    pub fn codec(&self) -> Arc<dyn PayloadCodec> {
        match &self.codec {
            Some(codec) => codec.clone(),
            None => Arc::new(Cbor),
        }
    }

    fn apply(&mut self, overrides: &Overrides) {
        if let Some(eager) = overrides.eager {
            self.eager = eager;
        }
        if let Some(chunk_size) = overrides.chunk_size {
            self.chunk_size = chunk_size;
        }
        if let Some(rerun) = overrides.rerun_on_failure {
            self.rerun_on_failure = rerun;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(codec) = &overrides.codec {
            self.codec = codec.clone();
        }
        for (name, value) in &overrides.extra {
            self.extra.insert(name.clone(), value.clone());
        }
    }
}

impl PartialEq for Options {
    fn eq(&self, other: &Self) -> bool {
        let codec = match (&self.codec, &other.codec) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };

        codec
            && self.eager == other.eager
            && self.chunk_size == other.chunk_size
            && self.rerun_on_failure == other.rerun_on_failure
            && self.workers == other.workers
            && self.extra == other.extra
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("eager", &self.eager)
            .field("chunk_size", &self.chunk_size)
            .field("rerun_on_failure", &self.rerun_on_failure)
            .field("workers", &self.workers)
            .field("codec", &self.codec.as_ref().map(|c| c.name()))
            .field("extra", &self.extra)
            .finish()
    }
}

/// A batch of option changes, applied together by [`set`].
#[derive(Clone, Default)]
pub struct Overrides {
    eager: Option<bool>,
    chunk_size: Option<ChunkSize>,
    rerun_on_failure: Option<bool>,
    workers: Option<Option<NonZeroUsize>>,
    codec: Option<Option<Arc<dyn PayloadCodec>>>,
    extra: BTreeMap<String, Value>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = Some(eager);
        self
    }

    pub fn chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn rerun_on_failure(mut self, rerun: bool) -> Self {
        self.rerun_on_failure = Some(rerun);
        self
    }

    /// `0` restores the hardware default.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(NonZeroUsize::new(workers));
        self
    }

    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = Some(Some(codec));
        self
    }

    /// Sets an option by name. Known options are type-checked, any other name
    /// is stored as is.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<Self, OptionError> {
        let name = name.into();
        let value = value.into();
        let invalid = |expected| OptionError {
            name: name.clone(),
            expected,
        };

        match name.as_str() {
            "eager" => self.eager = Some(value.as_bool().ok_or_else(|| invalid("a bool"))?),
            "chunk_size" | "multiprocessing.chunk_size" => {
                let chunk = ChunkSize::from_value(&value).ok_or_else(|| invalid("an integer >= -1"))?;
                self.chunk_size = Some(chunk);
            }
            "rerun_on_failure" | "multiprocessing.rerun_exceptions_locally" => {
                self.rerun_on_failure = Some(value.as_bool().ok_or_else(|| invalid("a bool"))?)
            }
            "workers" | "multiprocessing.num_workers" => {
                let workers = match value {
                    Value::Null => None,
                    Value::Int(n) if n > 0 => NonZeroUsize::new(n as usize),
                    _ => return Err(invalid("a positive integer or null")),
                };
                self.workers = Some(workers);
            }
            "codec" => match value.as_str() {
                Some("cbor") => self.codec = Some(None),
                Some("json") => self.codec = Some(Some(Arc::new(crate::codec::Json))),
                _ => return Err(invalid("\"cbor\" or \"json\"")),
            },
            _ => {
                self.extra.insert(name.clone(), value);
            }
        }

        Ok(self)
    }
}

/// Restores the options captured by [`set`] when dropped.
#[must_use = "the overrides are reverted as soon as the scope is dropped"]
pub struct Scope {
    saved: Option<Options>,
    // bound to the thread whose options it restores
    _local: PhantomData<*const ()>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            // `try_with` because the guard may outlive the thread-local during
            // thread teardown.
            let _ = CURRENT.try_with(|current| *current.borrow_mut() = saved);
        }
    }
}

/// A snapshot of the current options.
pub fn get() -> Options {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn with<R>(f: impl FnOnce(&Options) -> R) -> R {
    CURRENT.with(|current| f(&current.borrow()))
}

/// Reads a single option by name from the current options.
pub fn get_option(name: &str) -> Option<Value> {
    CURRENT.with(|current| current.borrow().get(name))
}

/// Applies `overrides` until the returned guard is dropped.
pub fn set(overrides: Overrides) -> Scope {
    let saved = CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let saved = current.clone();
        current.apply(&overrides);
        saved
    });

    Scope {
        saved: Some(saved),
        _local: PhantomData,
    }
}

/// Runs `f` with `overrides` applied.
pub fn scoped<R>(overrides: Overrides, f: impl FnOnce() -> R) -> R {
    let _scope = set(overrides);
    f()
}
