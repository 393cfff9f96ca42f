use ferret_core::error::Result;
use ferret_core::kernel::KernelLibrary;
use ferret_core::stream::{Engine, Stream, Task};

/// Engine and stream owned by one driver call.
///
/// Work is queued with [`enqueue`](Self::enqueue) and runs, in order, only
/// when [`wait`](Self::wait) consumes the context. A context dropped with
/// queued work discards it.
pub struct ExecutionContext<'l, L: KernelLibrary + ?Sized> {
    library: &'l L,
    engine: Engine,
    stream: Stream,
}

impl<'l, L: KernelLibrary + ?Sized> ExecutionContext<'l, L> {
    /// Acquire engine `engine_index` from `library` and open a stream on it.
    pub fn create(library: &'l L, engine_index: usize) -> Result<Self> {
        let engine = library.engine(engine_index)?;
        log::trace!("context opened on {} ({})", engine, library.name());
        Ok(ExecutionContext {
            library,
            stream: Stream::new(engine.clone()),
            engine,
        })
    }

    pub fn library(&self) -> &'l L {
        self.library
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Number of tasks queued but not yet run.
    pub fn pending(&self) -> usize {
        self.stream.pending()
    }

    pub fn enqueue(&mut self, task: Task) {
        self.stream.enqueue(task);
    }

    /// Run every queued task in submission order, stopping at the first failure.
    pub fn wait(mut self) -> Result<()> {
        self.stream.drain()
    }
}

impl<L: KernelLibrary + ?Sized> Drop for ExecutionContext<'_, L> {
    fn drop(&mut self) {
        let dropped = self.stream.discard();
        if dropped > 0 {
            log::warn!(
                "context on {} released with {} undrained task(s)",
                self.engine,
                dropped
            );
        }
    }
}
