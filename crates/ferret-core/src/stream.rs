use std::collections::VecDeque;
use std::fmt;

use crate::error::Result;

// Engine & Stream
//
// An Engine identifies the compute device a buffer or primitive belongs to.
// A Stream is an in-order queue of Tasks bound to one engine. Work is only
// guaranteed complete once `drain` returns; results must not be read before.
//
// The CPU stream defers every task until `drain` and then runs them on the
// calling thread in submission order. A task may parallelize internally.

/// Kind of device an [`Engine`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Cpu,
}

/// Handle on one compute device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Engine {
    kind: EngineKind,
    index: usize,
}

impl Engine {
    pub fn cpu(index: usize) -> Self {
        Engine {
            kind: EngineKind::Cpu,
            index,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EngineKind::Cpu => write!(f, "cpu:{}", self.index),
        }
    }
}

/// A unit of enqueued work: one reorder or one primitive execution.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// In-order instruction stream bound to an engine.
pub struct Stream {
    engine: Engine,
    queue: VecDeque<Task>,
}

impl Stream {
    pub fn new(engine: Engine) -> Self {
        Stream {
            engine,
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    /// Number of tasks not yet executed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run every queued task in order. Stops at the first failure and drops
    /// the tasks behind it.
    pub fn drain(&mut self) -> Result<()> {
        let mut executed = 0usize;
        while let Some(task) = self.queue.pop_front() {
            if let Err(e) = task() {
                let dropped = self.queue.len();
                self.queue.clear();
                log::debug!(
                    "stream on {} failed after {executed} task(s), dropping {dropped}: {e}",
                    self.engine
                );
                return Err(e);
            }
            executed += 1;
        }
        log::trace!("stream on {} drained {executed} task(s)", self.engine);
        Ok(())
    }

    /// Drop queued tasks without running them. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("engine", &self.engine)
            .field("pending", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_tasks_run_in_order_on_drain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stream = Stream::new(Engine::cpu(0));
        for i in 0..3 {
            let log = log.clone();
            stream.enqueue(Box::new(move || {
                log.lock().unwrap().push(i);
                Ok(())
            }));
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(stream.pending(), 3);

        stream.drain().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_failure_stops_the_stream() {
        let ran = Arc::new(Mutex::new(false));
        let mut stream = Stream::new(Engine::cpu(0));
        stream.enqueue(Box::new(|| Err(Error::execution("boom"))));
        let flag = ran.clone();
        stream.enqueue(Box::new(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        }));

        let err = stream.drain().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(!*ran.lock().unwrap());
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_discard() {
        let mut stream = Stream::new(Engine::cpu(0));
        stream.enqueue(Box::new(|| Ok(())));
        stream.enqueue(Box::new(|| Ok(())));
        assert_eq!(stream.discard(), 2);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_engine_display() {
        assert_eq!(Engine::cpu(1).to_string(), "cpu:1");
    }
}
